use std::cell::RefCell;
use std::collections::HashMap;

use tracing::debug;

use super::bus::{EventBus, Handler};
use super::event::groups;

/// A handler filed while its channel was still buffering.
struct Registration {
    event: String,
    bus: EventBus,
    handler: Handler,
}

/// Drain participant state. A group drains only once every participant has
/// staged itself.
#[derive(Debug, Default)]
struct DrainGate {
    // Registration order doubles as drain order.
    participants: Vec<(String, bool)>,
}

impl DrainGate {
    fn register(&mut self, group: &str) {
        if !self.participants.iter().any(|(g, _)| g == group) {
            self.participants.push((group.to_string(), false));
        }
    }

    fn contains(&self, group: &str) -> bool {
        self.participants.iter().any(|(g, _)| g == group)
    }

    /// Returns the groups to drain now, if staging `group` completed the set.
    fn stage(&mut self, group: &str) -> Option<Vec<String>> {
        for (g, staged) in self.participants.iter_mut() {
            if g == group {
                *staged = true;
            }
        }
        if self.participants.iter().all(|(_, staged)| *staged) {
            Some(self.participants.drain(..).map(|(g, _)| g).collect())
        } else {
            None
        }
    }
}

/// Files handlers per group until their channel drains, then hands them to the bus.
pub struct HandlerRegistry {
    bus: EventBus,
    global: EventBus,
    handlers: RefCell<HashMap<String, Vec<Registration>>>,
    gate: RefCell<DrainGate>,
}

impl HandlerRegistry {
    pub fn new(bus: EventBus, global: EventBus) -> Self {
        Self {
            bus,
            global,
            handlers: RefCell::new(HashMap::new()),
            gate: RefCell::new(DrainGate::default()),
        }
    }

    /// Register against the agent bus (or `bus` when given). While the group's
    /// channel buffers the handler is filed and only sees history at drain.
    pub fn register(&self, event: &str, handler: Handler, group: Option<&str>, bus: Option<&EventBus>) {
        let group = group.unwrap_or(groups::DEFAULT);
        let bus = bus.unwrap_or(&self.bus).clone();

        if bus.is_buffering(group) {
            self.handlers
                .borrow_mut()
                .entry(group.to_string())
                .or_default()
                .push(Registration { event: event.to_string(), bus, handler });
        } else {
            bus.on(event, handler);
        }
    }

    /// Same contract against the bus shared by all agent instances.
    pub fn global_register(&self, event: &str, handler: Handler, group: Option<&str>) {
        let global = self.global.clone();
        self.register(event, handler, group, Some(&global));
    }

    pub fn pending_count(&self, group: &str) -> usize {
        self.handlers.borrow().get(group).map_or(0, |r| r.len())
    }

    /// Declare `group` as a drain participant: it will not drain until every
    /// participant has called `drain`.
    pub fn register_drain(&self, group: &str) {
        self.gate.borrow_mut().register(group);
    }

    pub fn drain(&self, group: &str) {
        let ready = {
            let mut gate = self.gate.borrow_mut();
            if gate.contains(group) {
                gate.stage(group)
            } else {
                Some(vec![group.to_string()])
            }
        };

        match ready {
            Some(groups) => {
                for group in groups {
                    self.drain_group(&group);
                }
            }
            None => debug!("drain of '{}' staged, waiting on other features", group),
        }
    }

    fn drain_group(&self, group: &str) {
        let filed = self.handlers.borrow_mut().remove(group).unwrap_or_default();

        let mut buses: Vec<EventBus> = vec![self.bus.clone()];
        for reg in filed {
            reg.bus.on(&reg.event, reg.handler);
            if !buses.iter().any(|b| b.same_bus(&reg.bus)) {
                buses.push(reg.bus);
            }
        }

        for bus in buses {
            bus.drain(group);
        }
    }
}
