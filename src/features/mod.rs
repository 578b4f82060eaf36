//! Feature aggregates. Each owns a bucketing policy, subscribes to its
//! events through the handler registry and feeds the shared aggregator.

pub mod custom_events;
pub mod errors;
pub mod metrics;
pub mod vitals;

use std::collections::{BTreeMap, HashMap};

use tracing::{debug, warn};

use crate::harvest::{HarvestId, HarvestResult};
use crate::kernel::aggregator::{Aggregator, Attributes, Bucket};
use crate::kernel::event::TelemetryEvent;
use crate::error::HandlerError;

pub type Taken = BTreeMap<String, Vec<Bucket>>;

/// Buckets taken for sends whose outcome is still unknown, one entry per
/// harvest. Harvests overlap when a send outlives the interval.
#[derive(Debug, Default)]
pub struct RetrySnapshot {
    held: HashMap<HarvestId, Taken>,
}

impl RetrySnapshot {
    pub fn hold(&mut self, harvest: HarvestId, taken: Taken) {
        self.held.insert(harvest, taken);
    }

    /// Release the harvest's entry. It goes back into the aggregator only when
    /// the send is worth retrying.
    pub fn settle(&mut self, harvest: HarvestId, result: &HarvestResult, aggregator: &mut Aggregator) {
        let Some(held) = self.held.remove(&harvest) else { return };
        if !(result.sent && result.retry) {
            return;
        }
        let mut restored = 0usize;
        for (kind, buckets) in held {
            for bucket in buckets {
                aggregator.merge_bucket(&kind, bucket);
                restored += 1;
            }
        }
        debug!("merged {} bucket(s) of harvest #{} back after failed send", restored, harvest);
    }
}

/// Serialize taken buckets as `{ type: [bucket, ...] }`.
pub fn body_from(taken: &BTreeMap<String, Vec<Bucket>>) -> Attributes {
    let mut body = Attributes::new();
    for (kind, buckets) in taken {
        match serde_json::to_value(buckets) {
            Ok(value) => {
                body.insert(kind.clone(), value);
            }
            Err(e) => warn!("could not encode '{}' buckets: {}", kind, e),
        }
    }
    body
}

pub(crate) fn unexpected(handler: &'static str, event: &TelemetryEvent) -> HandlerError {
    HandlerError::UnexpectedEvent {
        handler,
        event: format!("{:?}", event),
    }
}
