use std::cell::RefCell;
use std::collections::BTreeMap;
use std::rc::Rc;

use serde_json::Value;

use super::{body_from, unexpected};
use crate::harvest::{Contributor, HarvestOptions, Payload};
use crate::kernel::aggregator::{Aggregator, Attributes, Metric};
use crate::kernel::context::AgentContext;
use crate::kernel::event::{names, TelemetryEvent};

pub const FEATURE: &str = "metrics";
/// Metrics ride along on the errors endpoint through its shared payload.
pub const ENDPOINT: &str = "jserrors";

pub const SUPPORTABILITY: &str = "sm";
pub const CUSTOM: &str = "cm";

/// Supportability metrics (agent self-reporting) and caller-defined event metrics.
pub struct MetricsAggregate {
    aggregator: Rc<RefCell<Aggregator>>,
}

impl MetricsAggregate {
    pub fn new(ctx: &AgentContext) -> Rc<RefCell<Self>> {
        Rc::new(RefCell::new(Self {
            aggregator: ctx.aggregator.clone(),
        }))
    }

    pub fn register(this: &Rc<RefCell<Self>>, ctx: &AgentContext) {
        let feature = Rc::clone(this);
        ctx.registry.register(
            names::SUPPORTABILITY_METRIC,
            Rc::new(move |event: &TelemetryEvent| match event {
                TelemetryEvent::Supportability { name, value } => {
                    feature.borrow_mut().store_supportability(name, *value);
                    Ok(())
                }
                other => Err(unexpected("metrics", other)),
            }),
            Some(FEATURE),
            None,
        );

        let feature = Rc::clone(this);
        ctx.registry.register(
            names::EVENT_METRICS,
            Rc::new(move |event: &TelemetryEvent| match event {
                TelemetryEvent::EventMetrics { name, metrics } => {
                    feature.borrow_mut().store_event_metrics(name, metrics);
                    Ok(())
                }
                other => Err(unexpected("metrics", other)),
            }),
            Some(FEATURE),
            None,
        );
        ctx.registry.register_drain(FEATURE);
    }

    pub fn store_supportability(&mut self, name: &str, value: f64) {
        self.aggregator
            .borrow_mut()
            .store_metric(SUPPORTABILITY, name, named(name), value);
    }

    pub fn store_event_metrics(&mut self, name: &str, metrics: &BTreeMap<String, Metric>) {
        self.aggregator
            .borrow_mut()
            .store(CUSTOM, name, named(name), metrics, None);
    }

    pub fn take_payload(&mut self) -> Option<Payload> {
        let taken = self.aggregator.borrow_mut().take(&[SUPPORTABILITY, CUSTOM]);
        if taken.is_empty() {
            return None;
        }
        Some(Payload::with_body(body_from(&taken)))
    }

    /// Hook for the shared endpoint payload.
    pub fn contributor(this: &Rc<RefCell<Self>>) -> Contributor {
        let feature = Rc::clone(this);
        Rc::new(move |_opts: &HarvestOptions| feature.borrow_mut().take_payload())
    }
}

fn named(name: &str) -> Attributes {
    let mut params = Attributes::new();
    params.insert("name".into(), Value::from(name));
    params
}
