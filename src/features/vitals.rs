use std::cell::RefCell;
use std::collections::BTreeMap;
use std::rc::Rc;

use serde_json::Value;

use super::{body_from, unexpected, RetrySnapshot};
use crate::harvest::{HarvestId, HarvestResult, Payload, PayloadOptions};
use crate::kernel::aggregator::{Aggregator, Attributes, Metric};
use crate::kernel::context::AgentContext;
use crate::kernel::event::{names, TelemetryEvent, Vital};
use crate::kernel::scheduler::PayloadSource;

pub const FEATURE: &str = "page_view_timing";
pub const ENDPOINT: &str = "events";
pub const KIND: &str = "timing";

/// Paint, layout and interaction timings, summarised per vital per window.
pub struct VitalsAggregate {
    aggregator: Rc<RefCell<Aggregator>>,
    snapshot: RetrySnapshot,
}

impl VitalsAggregate {
    pub fn new(ctx: &AgentContext) -> Rc<RefCell<Self>> {
        Rc::new(RefCell::new(Self {
            aggregator: ctx.aggregator.clone(),
            snapshot: RetrySnapshot::default(),
        }))
    }

    pub fn register(this: &Rc<RefCell<Self>>, ctx: &AgentContext) {
        let feature = Rc::clone(this);
        ctx.registry.register(
            names::TIMING,
            Rc::new(move |event: &TelemetryEvent| match event {
                TelemetryEvent::Timing(vital) => {
                    feature.borrow_mut().record(vital);
                    Ok(())
                }
                other => Err(unexpected("vitals", other)),
            }),
            Some(FEATURE),
            None,
        );
        ctx.registry.register_drain(FEATURE);
    }

    /// Latest attributes (e.g. the LCP element) win; values accumulate.
    pub fn record(&mut self, vital: &Vital) {
        let name = vital.kind.as_str();
        let mut params = Attributes::new();
        params.insert("name".into(), Value::from(name));

        let mut metrics = BTreeMap::new();
        metrics.insert("value".to_string(), Metric::value(vital.value));
        let custom = (!vital.attributes.is_empty()).then(|| vital.attributes.clone());

        self.aggregator.borrow_mut().store(KIND, name, params, &metrics, custom);
    }
}

impl PayloadSource for VitalsAggregate {
    fn get_payload(&mut self, opts: PayloadOptions) -> Vec<Payload> {
        let taken = self.aggregator.borrow_mut().take(&[KIND]);
        if taken.is_empty() {
            return Vec::new();
        }
        let payload = Payload::with_body(body_from(&taken));
        if opts.retry {
            self.snapshot.hold(opts.harvest, taken);
        }
        vec![payload]
    }

    fn on_finished(&mut self, harvest: HarvestId, result: &HarvestResult) {
        self.snapshot.settle(harvest, result, &mut self.aggregator.borrow_mut());
    }
}
