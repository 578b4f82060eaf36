//! Contextual event bus.
//!
//! One bus per agent instance plus one thread-wide bus for handlers that must
//! observe every instance. Execution is single-threaded and cooperative, so the
//! bus is an `Rc<RefCell<..>>` handle and is never borrowed across a handler call.

use std::cell::RefCell;
use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::rc::Rc;

use tracing::{debug, warn};

use super::event::{names, LifecycleEvent, TelemetryEvent};
use crate::error::HandlerError;

pub type Handler = Rc<dyn Fn(&TelemetryEvent) -> Result<(), HandlerError>>;

thread_local! {
    static GLOBAL_BUS: EventBus = EventBus::new("global");
}

/// Per-category state. Once `drained` is set the channel never buffers again.
#[derive(Debug, Default)]
struct Channel {
    buffering: bool,
    drained: bool,
    backlog: Vec<(String, TelemetryEvent)>,
}

#[derive(Default)]
struct BusState {
    debug_id: String,
    listeners: HashMap<String, Vec<Handler>>,
    // event name -> channel (group) it buffers into
    channel_of: HashMap<String, String>,
    channels: HashMap<String, Channel>,
    aborted: bool,
}

/// Clone-cheap handle to one bus.
#[derive(Clone)]
pub struct EventBus {
    inner: Rc<RefCell<BusState>>,
}

impl EventBus {
    pub fn new(debug_id: &str) -> Self {
        Self {
            inner: Rc::new(RefCell::new(BusState {
                debug_id: debug_id.to_string(),
                ..Default::default()
            })),
        }
    }

    /// The bus shared by every agent instance on this thread.
    pub fn global() -> Self {
        GLOBAL_BUS.with(|bus| bus.clone())
    }

    pub fn debug_id(&self) -> String {
        self.inner.borrow().debug_id.clone()
    }

    pub fn same_bus(&self, other: &EventBus) -> bool {
        Rc::ptr_eq(&self.inner, &other.inner)
    }

    /// Attach a live listener. It sees emissions from now on, plus whatever a
    /// later `drain` replays.
    pub fn on(&self, name: &str, handler: Handler) {
        self.inner
            .borrow_mut()
            .listeners
            .entry(name.to_string())
            .or_default()
            .push(handler);
    }

    pub fn listener_count(&self, name: &str) -> usize {
        self.inner.borrow().listeners.get(name).map_or(0, |l| l.len())
    }

    /// Route `names` into the `group` channel, creating it in buffering state
    /// if it does not exist yet. A drained channel stays live.
    pub fn buffer(&self, event_names: &[&str], group: &str) {
        let mut state = self.inner.borrow_mut();
        if state.aborted {
            return;
        }
        let channel = state.channels.entry(group.to_string()).or_default();
        if !channel.drained {
            channel.buffering = true;
        }
        for name in event_names {
            state.channel_of.insert(name.to_string(), group.to_string());
        }
    }

    pub fn is_buffering(&self, group: &str) -> bool {
        self.inner
            .borrow()
            .channels
            .get(group)
            .is_some_and(|c| c.buffering)
    }

    pub fn backlog_len(&self, group: &str) -> usize {
        self.inner
            .borrow()
            .channels
            .get(group)
            .map_or(0, |c| c.backlog.len())
    }

    pub fn is_aborted(&self) -> bool {
        self.inner.borrow().aborted
    }

    /// Fire-and-forget. Buffered names are queued on their channel; everything
    /// else is dispatched now, in registration order.
    pub fn emit(&self, name: &str, event: TelemetryEvent) {
        let handlers = {
            let mut state = self.inner.borrow_mut();
            if state.aborted {
                return;
            }
            let group = state.channel_of.get(name).cloned();
            if let Some(channel) = group.and_then(|g| state.channels.get_mut(&g)) {
                if channel.buffering {
                    channel.backlog.push((name.to_string(), event));
                    return;
                }
            }
            state.listeners.get(name).cloned().unwrap_or_default()
        };
        dispatch(name, &handlers, &event);
    }

    /// Replay the channel backlog in arrival order, then switch it to live
    /// delivery for good. Unknown channels are a no-op.
    pub fn drain(&self, group: &str) {
        {
            let state = self.inner.borrow();
            match state.channels.get(group) {
                Some(channel) if !channel.drained => {}
                _ => return,
            }
        }

        let mut replayed = 0usize;
        loop {
            // Handlers may emit into this channel while we replay; those land
            // behind the current batch so arrival order holds.
            let batch = {
                let mut state = self.inner.borrow_mut();
                let Some(channel) = state.channels.get_mut(group) else { return };
                std::mem::take(&mut channel.backlog)
            };
            if batch.is_empty() {
                break;
            }
            for (name, event) in batch {
                let handlers = self
                    .inner
                    .borrow()
                    .listeners
                    .get(&name)
                    .cloned()
                    .unwrap_or_default();
                dispatch(&name, &handlers, &event);
                replayed += 1;
            }
        }

        {
            let mut state = self.inner.borrow_mut();
            if let Some(channel) = state.channels.get_mut(group) {
                channel.buffering = false;
                channel.drained = true;
            }
            debug!("[{}] drained '{}' ({} events replayed)", state.debug_id, group, replayed);
        }

        self.emit(
            &names::drained(group),
            TelemetryEvent::Lifecycle(LifecycleEvent::Drained { group: group.to_string() }),
        );
    }

    /// Drop every backlog and ignore all further emissions.
    pub fn abort(&self) {
        let mut state = self.inner.borrow_mut();
        state.aborted = true;
        for channel in state.channels.values_mut() {
            channel.backlog.clear();
            channel.buffering = false;
        }
        warn!("[{}] event bus aborted", state.debug_id);
    }
}

fn dispatch(name: &str, handlers: &[Handler], event: &TelemetryEvent) {
    for handler in handlers {
        match panic::catch_unwind(AssertUnwindSafe(|| handler(event))) {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!("handler for '{}' failed: {}", name, e),
            Err(_) => warn!("handler for '{}' panicked", name),
        }
    }
}
