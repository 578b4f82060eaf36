use std::cell::RefCell;
use std::collections::{BTreeMap, HashSet};
use std::rc::Rc;

use serde_json::Value;

use super::{body_from, unexpected, RetrySnapshot};
use crate::harvest::{HarvestId, HarvestResult, Payload, PayloadOptions};
use crate::kernel::aggregator::{Aggregator, Attributes, Metric};
use crate::kernel::context::AgentContext;
use crate::kernel::event::{names, ErrorEvent, TelemetryEvent};
use crate::kernel::scheduler::PayloadSource;

pub const FEATURE: &str = "jserrors";
pub const ENDPOINT: &str = "jserrors";

const KINDS: [&str; 2] = [names::ERROR, names::INTERNAL_ERROR];

/// Groups identical errors (same class, message and stack) into one bucket
/// per harvest window.
pub struct ErrorsAggregate {
    aggregator: Rc<RefCell<Aggregator>>,
    page_url: String,
    // A stack's full text is sent once per page; repeats carry only its hash.
    stack_reported: HashSet<i32>,
    snapshot: RetrySnapshot,
}

impl ErrorsAggregate {
    pub fn new(ctx: &AgentContext, page_url: &str) -> Rc<RefCell<Self>> {
        Rc::new(RefCell::new(Self {
            aggregator: ctx.aggregator.clone(),
            page_url: page_url.to_string(),
            stack_reported: HashSet::new(),
            snapshot: RetrySnapshot::default(),
        }))
    }

    pub fn register(this: &Rc<RefCell<Self>>, ctx: &AgentContext) {
        for kind in KINDS {
            let feature = Rc::clone(this);
            ctx.registry.register(
                kind,
                Rc::new(move |event: &TelemetryEvent| match event {
                    TelemetryEvent::Error(err) => {
                        feature.borrow_mut().store_error(kind, err);
                        Ok(())
                    }
                    other => Err(unexpected("jserrors", other)),
                }),
                Some(FEATURE),
                None,
            );
        }
        ctx.registry.register_drain(FEATURE);
    }

    pub fn store_error(&mut self, kind: &str, err: &ErrorEvent) {
        let stack = err.stack.as_deref().unwrap_or("");
        let key = string_hash(&format!("{}_{}_{}", err.class, err.message, stack)).to_string();
        let stack_hash = string_hash(stack);

        let mut aggregator = self.aggregator.borrow_mut();

        let mut params = match aggregator.get(kind, &key) {
            Some(existing) => existing.params.clone(),
            None => {
                let mut params = Attributes::new();
                params.insert("exceptionClass".into(), Value::from(err.class.clone()));
                params.insert("message".into(), Value::from(err.message.clone()));
                params.insert("pageUrl".into(), Value::from(self.page_url.clone()));
                params.insert("browser_stack_hash".into(), Value::from(stack_hash));
                params
            }
        };
        if !stack.is_empty() && self.stack_reported.insert(stack_hash) {
            params.insert("stack_trace".into(), Value::from(stack));
        }

        let mut metrics = BTreeMap::new();
        metrics.insert("time".to_string(), Metric::value(err.at.ms as f64));
        let custom = (!err.custom.is_empty()).then(|| err.custom.clone());

        aggregator.store(kind, &key, params, &metrics, custom);
    }
}

impl PayloadSource for ErrorsAggregate {
    fn get_payload(&mut self, opts: PayloadOptions) -> Vec<Payload> {
        let taken = self.aggregator.borrow_mut().take(&KINDS);
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

/// 32-bit rolling string hash, matching the collector's bucket fingerprints.
pub fn string_hash(s: &str) -> i32 {
    s.encode_utf16()
        .fold(0i32, |hash, c| hash.wrapping_shl(5).wrapping_sub(hash).wrapping_add(c as i32))
}
