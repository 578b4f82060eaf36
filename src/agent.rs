use std::cell::RefCell;
use std::collections::BTreeMap;
use std::rc::Rc;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::config::AgentConfig;
use crate::features::custom_events::{self, CustomEventsAggregate};
use crate::features::errors::{self, ErrorsAggregate};
use crate::features::metrics::{self, MetricsAggregate};
use crate::features::vitals::{self, VitalsAggregate};
use crate::harvest::{HarvestResult, Harvester, Transport};
use crate::kernel::aggregator::{Attributes, Metric};
use crate::kernel::context::AgentContext;
use crate::kernel::event::{groups, names, ErrorEvent, TelemetryEvent, Vital};
use crate::kernel::reactor::{Outbound, Reactor, SendId};
use crate::kernel::scheduler::{HarvestScheduler, PayloadSource, SchedulerOptions};
use crate::kernel::time::Tick;

/// Feature aggregates built during attach. `None` when disabled.
#[derive(Default)]
pub struct Features {
    pub errors: Option<Rc<RefCell<ErrorsAggregate>>>,
    pub metrics: Option<Rc<RefCell<MetricsAggregate>>>,
    pub custom_events: Option<Rc<RefCell<CustomEventsAggregate>>>,
    pub vitals: Option<Rc<RefCell<VitalsAggregate>>>,
}

/// One agent instance.
///
/// Startup is two-phase: `install` opens buffering channels so instrumentation
/// can emit right away; `attach_features` builds the aggregates and drains.
pub struct Agent {
    pub config: AgentConfig,
    pub ctx: AgentContext,
    pub reactor: Reactor,
    pub features: Features,
    attached: bool,
}

impl Agent {
    pub fn install(config: AgentConfig) -> Self {
        let ctx = AgentContext::new(&config.agent_id);
        Self::install_with_context(config, ctx)
    }

    pub fn install_with_context(config: AgentConfig, ctx: AgentContext) -> Self {
        ctx.bus.buffer(&[names::ERROR, names::INTERNAL_ERROR], errors::FEATURE);
        ctx.bus.buffer(&[names::SUPPORTABILITY_METRIC, names::EVENT_METRICS], metrics::FEATURE);
        ctx.bus.buffer(&[names::CUSTOM_EVENT], groups::API);
        ctx.bus.buffer(&[names::TIMING], vitals::FEATURE);

        info!("agent {} installed, buffering instrumentation", ctx.agent_id);

        let reactor = Reactor::new(Harvester::new(&config));
        Self {
            config,
            ctx,
            reactor,
            features: Features::default(),
            attached: false,
        }
    }

    pub fn is_attached(&self) -> bool {
        self.attached
    }

    /// Build enabled features, register their handlers and timers, then drain
    /// everything buffered since install. Calling it twice does nothing.
    pub fn attach_features(&mut self, now: Tick) {
        if self.attached {
            return;
        }
        self.attached = true;

        let sched_opts = SchedulerOptions { retry_delay: self.config.retry_delay() };
        let mut drains: Vec<&str> = Vec::new();
        let mut dropped: Vec<&str> = Vec::new();

        if self.config.jserrors.enabled {
            let feature = ErrorsAggregate::new(&self.ctx, &self.config.page_url);
            ErrorsAggregate::register(&feature, &self.ctx);
            let source: Rc<RefCell<dyn PayloadSource>> = feature.clone();
            let mut scheduler = HarvestScheduler::new(errors::ENDPOINT, Some(source), sched_opts);
            scheduler.start_timer(now, self.config.jserrors.interval(), None);
            self.reactor.add_scheduler(scheduler);
            self.features.errors = Some(feature);
            drains.push(errors::FEATURE);
        } else {
            dropped.push(errors::FEATURE);
        }

        if self.config.metrics.enabled {
            let feature = MetricsAggregate::new(&self.ctx);
            MetricsAggregate::register(&feature, &self.ctx);
            self.reactor
                .harvester
                .on(metrics::ENDPOINT, MetricsAggregate::contributor(&feature));
            // Not started: metrics leave only with the final harvest.
            self.reactor
                .add_scheduler(HarvestScheduler::new(metrics::ENDPOINT, None, sched_opts));
            self.features.metrics = Some(feature);
            drains.push(metrics::FEATURE);
        } else {
            dropped.push(metrics::FEATURE);
        }

        if self.config.custom_events.enabled {
            let feature = CustomEventsAggregate::new(&self.ctx, self.config.custom_events.max_events_per_harvest);
            CustomEventsAggregate::register(&feature, &self.ctx);
            let source: Rc<RefCell<dyn PayloadSource>> = feature.clone();
            let mut scheduler = HarvestScheduler::new(custom_events::ENDPOINT, Some(source), sched_opts);
            scheduler.start_timer(now, self.config.custom_events.interval(), None);
            self.reactor.add_scheduler(scheduler);
            self.features.custom_events = Some(feature);
            drains.push(groups::API);
        } else {
            dropped.push(groups::API);
        }

        if self.config.vitals.enabled {
            let feature = VitalsAggregate::new(&self.ctx);
            VitalsAggregate::register(&feature, &self.ctx);
            let source: Rc<RefCell<dyn PayloadSource>> = feature.clone();
            let mut scheduler = HarvestScheduler::new(vitals::ENDPOINT, Some(source), sched_opts);
            scheduler.start_timer(now, self.config.vitals.interval(), None);
            self.reactor.add_scheduler(scheduler);
            self.features.vitals = Some(feature);
            drains.push(vitals::FEATURE);
        } else {
            dropped.push(vitals::FEATURE);
        }

        // Disabled features have no handlers; let their channels go live so
        // nothing piles up behind them.
        for group in dropped {
            self.ctx.bus.drain(group);
        }
        for group in drains {
            self.ctx.registry.drain(group);
        }
        info!("agent {} attached at {}ms", self.ctx.agent_id, now.ms);
    }

    pub fn notice_error(&self, err: ErrorEvent) {
        self.ctx.handle(names::ERROR, TelemetryEvent::Error(err));
    }

    /// Errors raised by the agent itself.
    pub fn notice_internal_error(&self, err: ErrorEvent) {
        self.ctx.handle(names::INTERNAL_ERROR, TelemetryEvent::Error(err));
    }

    pub fn record_supportability(&self, name: &str, value: f64) {
        self.ctx.handle(names::SUPPORTABILITY_METRIC,
            TelemetryEvent::Supportability { name: name.to_string(), value });
    }

    pub fn record_event_metrics(&self, name: &str, metrics: BTreeMap<String, Metric>) {
        self.ctx.handle(names::EVENT_METRICS,
            TelemetryEvent::EventMetrics { name: name.to_string(), metrics });
    }

    pub fn add_custom_event(&self, at: Tick, name: &str, attributes: Attributes) {
        self.ctx.handle(names::CUSTOM_EVENT,
            TelemetryEvent::CustomEvent { at, name: name.to_string(), attributes });
    }

    pub fn record_timing(&self, vital: Vital) {
        self.ctx.handle(names::TIMING, TelemetryEvent::Timing(vital));
    }

    pub fn tick_step(&mut self, now: Tick) -> Vec<Outbound> {
        self.reactor.tick_step(now)
    }

    pub fn harvest_finished(&mut self, id: SendId, result: HarvestResult, now: Tick) {
        self.reactor.harvest_finished(id, result, now);
    }

    pub fn final_harvest(&mut self, now: Tick) -> Vec<Outbound> {
        self.reactor.final_harvest(now)
    }

    /// Drive harvests in real time until `shutdown` fires, then tear down.
    pub async fn run(&mut self, transport: Arc<dyn Transport>, shutdown: CancellationToken) {
        self.reactor.run(transport, shutdown).await;
        self.ctx.bus.abort();
        info!("agent {} stopped", self.ctx.agent_id);
    }
}
