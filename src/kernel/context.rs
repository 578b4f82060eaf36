use std::cell::RefCell;
use std::rc::Rc;

use super::aggregator::Aggregator;
use super::bus::EventBus;
use super::event::TelemetryEvent;
use super::registry::HandlerRegistry;

/// Everything a component of one agent instance needs, passed explicitly.
/// Cloning shares the same bus, registry and aggregator.
#[derive(Clone)]
pub struct AgentContext {
    pub agent_id: String,
    pub bus: EventBus,
    pub global: EventBus,
    pub registry: Rc<HandlerRegistry>,
    pub aggregator: Rc<RefCell<Aggregator>>,
}

impl AgentContext {
    pub fn new(agent_id: &str) -> Self {
        Self::with_global(agent_id, EventBus::global())
    }

    pub fn with_global(agent_id: &str, global: EventBus) -> Self {
        let bus = EventBus::new(agent_id);
        Self {
            agent_id: agent_id.to_string(),
            registry: Rc::new(HandlerRegistry::new(bus.clone(), global.clone())),
            bus,
            global,
            aggregator: Rc::new(RefCell::new(Aggregator::new())),
        }
    }

    /// Instrumentation entry point. Never fails and never opens a channel:
    /// whether `name` buffers was decided when the agent was installed.
    pub fn handle(&self, name: &str, event: TelemetryEvent) {
        self.bus.emit(name, event);
    }
}
