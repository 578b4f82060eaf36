use std::cell::RefCell;
use std::rc::Rc;
use std::time::Duration;

use tracing::{debug, info};

use super::time::Tick;
use crate::harvest::{HarvestId, HarvestOptions, HarvestResult, Harvester, Payload, PayloadOptions, SubmitRequest};

/// Owner side of a scheduler: supplies payloads and hears how they fared.
///
/// Sends from consecutive harvests may be in flight at the same time, so a
/// provider files whatever it keeps for retry under `opts.harvest` and settles
/// it when a result for that harvest arrives.
pub trait PayloadSource {
    /// Zero, one or several payloads; each is sent on its own.
    fn get_payload(&mut self, opts: PayloadOptions) -> Vec<Payload>;

    fn on_finished(&mut self, _harvest: HarvestId, _result: &HarvestResult) {}
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SchedulerOptions {
    /// Used when a retryable result carries no delay of its own.
    pub retry_delay: Option<Duration>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerState {
    Idle,
    TimerPending,
}

/// The armed one-shot timer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PendingHarvest {
    pub at: Tick,
    pub opts: HarvestOptions,
}

/// Requests built by one harvest run.
#[derive(Debug, Clone)]
pub struct HarvestRun {
    pub id: HarvestId,
    pub opts: HarvestOptions,
    pub requests: Vec<SubmitRequest>,
}

/// Per-endpoint harvest timer. Never holds more than one pending timer.
pub struct HarvestScheduler {
    endpoint: String,
    source: Option<Rc<RefCell<dyn PayloadSource>>>,
    opts: SchedulerOptions,
    interval: Duration,
    started: bool,
    // Set by stop_timer: late results may no longer arm anything.
    stopped: bool,
    pending: Option<PendingHarvest>,
    next_harvest: HarvestId,
}

impl HarvestScheduler {
    /// `source = None` harvests the endpoint's shared payload instead.
    pub fn new(endpoint: &str, source: Option<Rc<RefCell<dyn PayloadSource>>>, opts: SchedulerOptions) -> Self {
        Self {
            endpoint: endpoint.to_string(),
            source,
            opts,
            interval: Duration::ZERO,
            started: false,
            stopped: false,
            pending: None,
            next_harvest: 0,
        }
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub fn is_started(&self) -> bool {
        self.started
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn state(&self) -> SchedulerState {
        match self.pending {
            Some(_) => SchedulerState::TimerPending,
            None => SchedulerState::Idle,
        }
    }

    pub fn next_harvest_at(&self) -> Option<Tick> {
        self.pending.map(|p| p.at)
    }

    pub fn start_timer(&mut self, now: Tick, interval: Duration, initial_delay: Option<Duration>) {
        self.interval = interval;
        self.started = true;
        self.stopped = false;
        self.schedule_harvest(now, Some(initial_delay.unwrap_or(interval)), HarvestOptions::default());
        info!("[{}] harvest timer started, every {:?}", self.endpoint, interval);
    }

    /// Clears the pending timer. Sends already dispatched still report back,
    /// but their results no longer schedule anything.
    pub fn stop_timer(&mut self) {
        self.started = false;
        self.stopped = true;
        self.pending = None;
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped
    }

    /// Arm the one-shot timer unless one is already pending. Returns whether
    /// a timer was armed.
    pub fn schedule_harvest(&mut self, now: Tick, delay: Option<Duration>, opts: HarvestOptions) -> bool {
        if self.pending.is_some() {
            return false;
        }
        let delay = delay.unwrap_or(self.interval);
        self.pending = Some(PendingHarvest { at: now.after(delay), opts });
        true
    }

    pub fn is_due(&self, now: Tick) -> bool {
        self.pending.is_some_and(|p| p.at <= now)
    }

    /// Fire the timer if its deadline has passed.
    pub fn fire_if_due(&mut self, now: Tick, harvester: &Harvester) -> Option<HarvestRun> {
        match self.pending {
            Some(p) if p.at <= now => {
                self.pending = None;
                Some(self.run_harvest(now, p.opts, harvester))
            }
            _ => None,
        }
    }

    /// Collect payloads and build their requests, then re-arm the regular
    /// cadence if the timer is running. Re-arming does not wait for the sends.
    pub fn run_harvest(&mut self, now: Tick, opts: HarvestOptions, harvester: &Harvester) -> HarvestRun {
        let id = self.next_harvest;
        self.next_harvest += 1;

        let requests: Vec<SubmitRequest> = match &self.source {
            Some(source) => {
                let payload_opts = PayloadOptions { retry: !opts.unload, harvest: id };
                let payloads = source.borrow_mut().get_payload(payload_opts);
                let offered = payloads.len();
                let requests: Vec<SubmitRequest> = payloads
                    .into_iter()
                    .filter_map(|payload| harvester.request(&self.endpoint, payload, &opts))
                    .collect();
                // Nothing will report back for this harvest; release what the
                // provider kept for it.
                if offered > 0 && requests.is_empty() {
                    source.borrow_mut().on_finished(id, &HarvestResult::not_sent());
                }
                requests
            }
            None => {
                let payload = harvester.create_payload(&self.endpoint, &opts);
                harvester.request(&self.endpoint, payload, &opts).into_iter().collect()
            }
        };

        debug!("[{}] harvest #{} at {}ms: {} send(s)", self.endpoint, id, now.ms, requests.len());

        if self.started {
            self.schedule_harvest(now, None, HarvestOptions::default());
        }
        HarvestRun { id, opts, requests }
    }

    /// Completion of one send. A retryable result with a delay replaces the
    /// regular timer with a one-shot at that delay. A scheduler that was never
    /// started gets exactly one follow-up; one that was stopped gets none.
    pub fn on_harvest_finished(&mut self, now: Tick, harvest: HarvestId, opts: HarvestOptions, result: &HarvestResult) {
        if let Some(source) = &self.source {
            source.borrow_mut().on_finished(harvest, result);
        }

        if self.stopped || !(result.sent && result.retry) {
            return;
        }
        let Some(delay) = result.delay.or(self.opts.retry_delay) else {
            return;
        };

        if self.started {
            self.pending = None;
        }
        if self.schedule_harvest(now, Some(delay), opts) {
            info!("[{}] retry scheduled in {:?}", self.endpoint, delay);
        }
    }
}
