use std::cell::RefCell;
use std::collections::BTreeMap;
use std::rc::Rc;

use serde_json::Value;
use tracing::warn;

use super::{unexpected, RetrySnapshot};
use crate::harvest::{HarvestId, HarvestResult, Payload, PayloadOptions};
use crate::kernel::aggregator::{Aggregator, Attributes};
use crate::kernel::context::AgentContext;
use crate::kernel::event::{groups, names, TelemetryEvent};
use crate::kernel::scheduler::PayloadSource;
use crate::kernel::time::Tick;

pub const FEATURE: &str = "custom_events";
pub const ENDPOINT: &str = "ins";
pub const KIND: &str = "ins";
pub const DROPPED_METRIC: &str = "CustomEvent/Dropped";

/// Caller-defined events. Never merged: every event gets its own bucket,
/// keyed by arrival sequence so a window replays in order.
pub struct CustomEventsAggregate {
    ctx: AgentContext,
    max_per_harvest: usize,
    seq: u64,
    snapshot: RetrySnapshot,
}

impl CustomEventsAggregate {
    pub fn new(ctx: &AgentContext, max_per_harvest: usize) -> Rc<RefCell<Self>> {
        Rc::new(RefCell::new(Self {
            ctx: ctx.clone(),
            max_per_harvest,
            seq: 0,
            snapshot: RetrySnapshot::default(),
        }))
    }

    fn aggregator(&self) -> &Rc<RefCell<Aggregator>> {
        &self.ctx.aggregator
    }

    /// Events come in through the public API, so they live in the `api` group.
    pub fn register(this: &Rc<RefCell<Self>>, ctx: &AgentContext) {
        let feature = Rc::clone(this);
        ctx.registry.register(
            names::CUSTOM_EVENT,
            Rc::new(move |event: &TelemetryEvent| match event {
                TelemetryEvent::CustomEvent { at, name, attributes } => {
                    feature.borrow_mut().add_event(*at, name, attributes);
                    Ok(())
                }
                other => Err(unexpected("custom_events", other)),
            }),
            Some(groups::API),
            None,
        );
        ctx.registry.register_drain(groups::API);
    }

    pub fn add_event(&mut self, at: Tick, name: &str, attributes: &Attributes) {
        let stored = {
            let mut aggregator = self.aggregator().borrow_mut();
            if aggregator.len(KIND) >= self.max_per_harvest {
                false
            } else {
                let mut params = attributes.clone();
                params.insert("eventType".into(), Value::from("CustomEvent"));
                params.insert("name".into(), Value::from(name));
                params.insert("timestamp".into(), Value::from(at.ms));
                let key = format!("{:016}", self.seq);
                aggregator.store(KIND, &key, params, &BTreeMap::new(), None);
                true
            }
        };

        if stored {
            self.seq += 1;
        } else {
            warn!("custom event '{}' dropped: harvest window full", name);
            self.ctx.handle(
                names::SUPPORTABILITY_METRIC,
                TelemetryEvent::Supportability {
                    name: DROPPED_METRIC.to_string(),
                    value: 1.0,
                },
            );
        }
    }
}

impl PayloadSource for CustomEventsAggregate {
    fn get_payload(&mut self, opts: PayloadOptions) -> Vec<Payload> {
        let taken = self.aggregator().borrow_mut().take(&[KIND]);
        let Some(buckets) = taken.get(KIND) else {
            return Vec::new();
        };

        // The collector wants the flat event attributes, not bucket envelopes.
        let events: Vec<Value> = buckets.iter().map(|b| Value::Object(b.params.clone())).collect();
        let mut body = Attributes::new();
        body.insert(KIND.into(), Value::Array(events));

        if opts.retry {
            self.snapshot.hold(opts.harvest, taken);
        }
        vec![Payload::with_body(body)]
    }

    fn on_finished(&mut self, harvest: HarvestId, result: &HarvestResult) {
        let aggregator = Rc::clone(self.aggregator());
        self.snapshot.settle(harvest, result, &mut aggregator.borrow_mut());
    }
}
