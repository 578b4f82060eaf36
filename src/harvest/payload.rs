use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::kernel::aggregator::Attributes;

/// What one send carries: extra query parameters and a JSON body.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Payload {
    pub qs: BTreeMap<String, String>,
    pub body: Attributes,
}

impl Payload {
    pub fn with_body(body: Attributes) -> Self {
        Self { qs: BTreeMap::new(), body }
    }

    pub fn is_empty(&self) -> bool {
        self.body.is_empty()
    }

    /// Fold another contribution in. Later contributors win on key clashes.
    pub fn merge(&mut self, other: Payload) {
        self.qs.extend(other.qs);
        self.body.extend(other.body);
    }
}

/// Options for one harvest run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HarvestOptions {
    /// Final harvest on page/agent unload; submitted beacon-style.
    pub unload: bool,
}

impl HarvestOptions {
    pub fn unload() -> Self {
        Self { unload: true }
    }

    pub fn submit_method(&self) -> SubmitMethod {
        if self.unload {
            SubmitMethod::Beacon
        } else {
            SubmitMethod::Xhr
        }
    }
}

/// Identifies one harvest run of one scheduler. Results of the sends built
/// from that run come back tagged with it.
pub type HarvestId = u64;

/// Handed to a payload provider so it knows whether to keep a retry snapshot,
/// and under which harvest to file it.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PayloadOptions {
    pub retry: bool,
    pub harvest: HarvestId,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SubmitMethod {
    /// Response observed; retry possible.
    Xhr,
    /// Fire-and-forget; the response is never inspected.
    Beacon,
}

/// A fully built request, ready to hand to a `Transport`.
#[derive(Debug, Clone, PartialEq)]
pub struct SubmitRequest {
    pub endpoint: String,
    pub url: String,
    pub query: Vec<(String, String)>,
    pub body: String,
    pub method: SubmitMethod,
}

/// Outcome of one send as reported by the transport.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HarvestResult {
    pub sent: bool,
    pub retry: bool,
    pub delay: Option<Duration>,
    pub status: Option<u16>,
}

impl HarvestResult {
    /// Nothing left the agent.
    pub fn not_sent() -> Self {
        Self::default()
    }

    pub fn delivered(status: u16) -> Self {
        Self {
            sent: true,
            retry: false,
            delay: None,
            status: Some(status),
        }
    }

    /// Classify an HTTP status. `too_many_requests_delay` applies to 429 only.
    pub fn from_status(status: u16, too_many_requests_delay: Duration) -> Self {
        let retry = should_retry(status);
        Self {
            sent: true,
            retry,
            delay: if status == 429 { Some(too_many_requests_delay) } else { None },
            status: Some(status),
        }
    }

    /// Timeout or connection failure: attempted, worth retrying.
    pub fn network_failure() -> Self {
        Self {
            sent: true,
            retry: true,
            delay: None,
            status: None,
        }
    }
}

pub fn should_retry(status: u16) -> bool {
    matches!(status, 408 | 429 | 500 | 502..=504 | 512..=530)
}
