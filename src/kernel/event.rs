use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::aggregator::{Attributes, Metric};
use super::time::Tick;

/// Event names shared between instrumentation and feature aggregates.
pub mod names {
    pub const ERROR: &str = "err";
    pub const INTERNAL_ERROR: &str = "ierr";
    pub const SUPPORTABILITY_METRIC: &str = "storeSupportabilityMetrics";
    pub const EVENT_METRICS: &str = "storeEventMetrics";
    pub const CUSTOM_EVENT: &str = "api-addCustomEvent";
    pub const TIMING: &str = "timing";

    /// Name of the lifecycle event emitted once a channel finishes draining.
    pub fn drained(group: &str) -> String {
        format!("drain-{}", group)
    }
}

/// Handler groups. A group is also the name of the bus channel that buffers
/// its events until the owning feature is attached.
pub mod groups {
    pub const DEFAULT: &str = "feature";
    pub const API: &str = "api";
}

/// Everything instrumentation can put on the bus.
///
/// Payloads carry identifiers, timings and caller attributes only. Stack
/// strings arrive pre-formatted; parsing them is not the agent's job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum TelemetryEvent {
    Error(ErrorEvent),

    Supportability {
        name: String,
        value: f64,
    },

    EventMetrics {
        name: String,
        metrics: BTreeMap<String, Metric>,
    },

    CustomEvent {
        at: Tick,
        name: String,
        attributes: Attributes,
    },

    Timing(Vital),

    Lifecycle(LifecycleEvent),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorEvent {
    pub at: Tick,
    pub class: String,
    pub message: String,
    pub stack: Option<String>,
    pub custom: Attributes,
}

impl ErrorEvent {
    pub fn new(at: Tick, class: &str, message: &str) -> Self {
        Self {
            at,
            class: class.to_string(),
            message: message.to_string(),
            stack: None,
            custom: Attributes::new(),
        }
    }

    pub fn with_stack(mut self, stack: &str) -> Self {
        self.stack = Some(stack.to_string());
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum VitalKind {
    FirstContentfulPaint,
    LargestContentfulPaint,
    CumulativeLayoutShift,
    InteractionToNextPaint,
    FirstInputDelay,
    Load,
    PageHide,
}

impl VitalKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            VitalKind::FirstContentfulPaint => "fcp",
            VitalKind::LargestContentfulPaint => "lcp",
            VitalKind::CumulativeLayoutShift => "cls",
            VitalKind::InteractionToNextPaint => "inp",
            VitalKind::FirstInputDelay => "fi",
            VitalKind::Load => "load",
            VitalKind::PageHide => "pageHide",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Vital {
    pub at: Tick,
    pub kind: VitalKind,
    pub value: f64,
    pub attributes: Attributes,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum LifecycleEvent {
    Drained { group: String },
}
