use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::mpsc;
use tokio::time::{interval, Duration};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::scheduler::{HarvestRun, HarvestScheduler};
use super::time::{Tick, TICK_MS};
use crate::harvest::{HarvestId, HarvestOptions, HarvestResult, Harvester, SubmitRequest, Transport};

pub type SendId = u64;

/// A request the driver must hand to the transport.
#[derive(Debug, Clone)]
pub struct Outbound {
    pub id: SendId,
    pub request: SubmitRequest,
}

struct InFlight {
    scheduler: usize,
    harvest: HarvestId,
    opts: HarvestOptions,
}

/// Owns every harvest scheduler of an agent and the table of sends awaiting
/// a result. Steps are synchronous; only `run` touches real time or I/O.
pub struct Reactor {
    pub harvester: Harvester,
    schedulers: Vec<HarvestScheduler>,
    in_flight: HashMap<SendId, InFlight>,
    next_send: SendId,
    pub tick: Tick,
}

impl Reactor {
    pub fn new(harvester: Harvester) -> Self {
        Self {
            harvester,
            schedulers: Vec::new(),
            in_flight: HashMap::new(),
            next_send: 0,
            tick: Tick::new(),
        }
    }

    pub fn add_scheduler(&mut self, scheduler: HarvestScheduler) -> usize {
        self.schedulers.push(scheduler);
        self.schedulers.len() - 1
    }

    pub fn scheduler(&self, index: usize) -> Option<&HarvestScheduler> {
        self.schedulers.get(index)
    }

    pub fn scheduler_mut(&mut self, index: usize) -> Option<&mut HarvestScheduler> {
        self.schedulers.get_mut(index)
    }

    pub fn schedulers(&self) -> &[HarvestScheduler] {
        &self.schedulers
    }

    pub fn in_flight_count(&self) -> usize {
        self.in_flight.len()
    }

    fn track(&mut self, scheduler: usize, run: HarvestRun) -> Vec<Outbound> {
        let HarvestRun { id: harvest, opts, requests } = run;
        requests
            .into_iter()
            .map(|request: SubmitRequest| {
                let id = self.next_send;
                self.next_send += 1;
                self.in_flight.insert(id, InFlight { scheduler, harvest, opts });
                Outbound { id, request }
            })
            .collect()
    }

    /// Fire every scheduler whose timer is due at `now`.
    /// MUST NOT await I/O or timers.
    pub fn tick_step(&mut self, now: Tick) -> Vec<Outbound> {
        self.tick = now;
        let mut outbound = Vec::new();
        for index in 0..self.schedulers.len() {
            if let Some(run) = self.schedulers[index].fire_if_due(now, &self.harvester) {
                outbound.extend(self.track(index, run));
            }
        }
        outbound
    }

    /// Route a transport result back to the scheduler that produced the send.
    pub fn harvest_finished(&mut self, id: SendId, result: HarvestResult, now: Tick) {
        self.tick = now;
        let Some(flight) = self.in_flight.remove(&id) else {
            debug!("result for unknown send {} ignored", id);
            return;
        };
        if let Some(scheduler) = self.schedulers.get_mut(flight.scheduler) {
            scheduler.on_harvest_finished(now, flight.harvest, flight.opts, &result);
        }
    }

    /// Unload: harvest every endpoint once, beacon-style.
    pub fn final_harvest(&mut self, now: Tick) -> Vec<Outbound> {
        self.tick = now;
        let opts = HarvestOptions::unload();
        let mut outbound = Vec::new();
        for index in 0..self.schedulers.len() {
            let run = self.schedulers[index].run_harvest(now, opts, &self.harvester);
            outbound.extend(self.track(index, run));
        }
        outbound
    }

    pub fn stop(&mut self) {
        for scheduler in &mut self.schedulers {
            scheduler.stop_timer();
        }
    }

    /// Async driver loop: cadence ticks fire harvests, transport results come
    /// back over a channel, cancellation triggers the final harvest.
    pub async fn run(&mut self, transport: Arc<dyn Transport>, shutdown: CancellationToken) {
        info!("Harvest reactor started. Cadence: {}ms", TICK_MS);

        let started = Instant::now();
        let (tx, mut rx) = mpsc::unbounded_channel::<(SendId, HarvestResult)>();

        let mut cadence = interval(Duration::from_millis(TICK_MS));
        cadence.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = cadence.tick() => {
                    let now = Tick::from_elapsed(started.elapsed());
                    let outbound = self.tick_step(now);
                    dispatch(&transport, &tx, outbound);
                }
                Some((id, result)) = rx.recv() => {
                    let now = Tick::from_elapsed(started.elapsed());
                    self.harvest_finished(id, result, now);
                }
                _ = shutdown.cancelled() => {
                    let now = Tick::from_elapsed(started.elapsed());
                    self.stop();
                    let outbound = self.final_harvest(now);
                    info!("Shutting down: final harvest with {} send(s)", outbound.len());
                    let handles = dispatch(&transport, &tx, outbound);
                    for handle in handles {
                        let _ = handle.await;
                    }
                    break;
                }
            }
        }
    }
}

fn dispatch(
    transport: &Arc<dyn Transport>,
    tx: &mpsc::UnboundedSender<(SendId, HarvestResult)>,
    outbound: Vec<Outbound>,
) -> Vec<tokio::task::JoinHandle<()>> {
    outbound
        .into_iter()
        .map(|out| {
            let transport = Arc::clone(transport);
            let tx = tx.clone();
            tokio::spawn(async move {
                let result = transport.submit(out.request).await;
                let _ = tx.send((out.id, result));
            })
        })
        .collect()
}
