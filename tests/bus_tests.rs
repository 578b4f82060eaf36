use std::cell::RefCell;
use std::rc::Rc;

use harvest_agent::kernel::bus::{EventBus, Handler};
use harvest_agent::kernel::context::AgentContext;
use harvest_agent::kernel::event::{names, LifecycleEvent, TelemetryEvent};
use harvest_agent::HandlerError;

type Log = Rc<RefCell<Vec<String>>>;

fn sm(name: &str) -> TelemetryEvent {
    TelemetryEvent::Supportability { name: name.to_string(), value: 1.0 }
}

fn label(event: &TelemetryEvent) -> String {
    match event {
        TelemetryEvent::Supportability { name, .. } => name.clone(),
        TelemetryEvent::Lifecycle(LifecycleEvent::Drained { group }) => format!("drained:{}", group),
        other => format!("{:?}", other),
    }
}

fn recorder(log: &Log, tag: &'static str) -> Handler {
    let log = Rc::clone(log);
    Rc::new(move |event: &TelemetryEvent| {
        log.borrow_mut().push(format!("{}:{}", tag, label(event)));
        Ok(())
    })
}

fn isolated(agent_id: &str) -> AgentContext {
    AgentContext::with_global(agent_id, EventBus::new("test-global"))
}

#[test]
fn test_buffered_events_replay_in_arrival_order_once() {
    let ctx = isolated("a1");
    let log: Log = Rc::default();

    ctx.bus.buffer(&["x", "y"], "feat");
    ctx.bus.emit("x", sm("1"));
    ctx.bus.emit("y", sm("2"));
    ctx.bus.emit("x", sm("3"));
    assert_eq!(ctx.bus.backlog_len("feat"), 3);

    ctx.registry.register("x", recorder(&log, "x"), Some("feat"), None);
    ctx.registry.register("y", recorder(&log, "y"), Some("feat"), None);
    assert_eq!(ctx.registry.pending_count("feat"), 2);
    assert!(log.borrow().is_empty(), "filed handlers must not run before drain");

    ctx.registry.drain("feat");
    assert_eq!(*log.borrow(), vec!["x:1", "y:2", "x:3"]);
    assert!(!ctx.bus.is_buffering("feat"));
    assert_eq!(ctx.bus.backlog_len("feat"), 0);

    ctx.bus.emit("x", sm("4"));
    assert_eq!(log.borrow().len(), 4);
    assert_eq!(log.borrow().last().map(String::as_str), Some("x:4"));
}

#[test]
fn test_handler_registered_after_drain_sees_no_history() {
    let ctx = isolated("a1");
    let early: Log = Rc::default();
    let late: Log = Rc::default();

    ctx.bus.buffer(&["x"], "feat");
    ctx.registry.register("x", recorder(&early, "early"), Some("feat"), None);
    ctx.bus.emit("x", sm("before"));
    ctx.registry.drain("feat");

    ctx.registry.register("x", recorder(&late, "late"), Some("feat"), None);
    assert_eq!(ctx.registry.pending_count("feat"), 0);
    ctx.bus.emit("x", sm("after"));

    assert_eq!(*early.borrow(), vec!["early:before", "early:after"]);
    assert_eq!(*late.borrow(), vec!["late:after"]);
}

#[test]
fn test_failing_handlers_do_not_block_later_ones() {
    let ctx = isolated("a1");
    let log: Log = Rc::default();

    ctx.registry.register(
        "x",
        Rc::new(|_: &TelemetryEvent| -> Result<(), HandlerError> { Err(HandlerError::Other("boom".into())) }),
        None,
        None,
    );
    ctx.registry.register(
        "x",
        Rc::new(|_: &TelemetryEvent| -> Result<(), HandlerError> { panic!("handler blew up") }),
        None,
        None,
    );
    ctx.registry.register("x", recorder(&log, "ok"), None, None);

    ctx.bus.emit("x", sm("1"));
    ctx.bus.emit("x", sm("2"));

    assert_eq!(*log.borrow(), vec!["ok:1", "ok:2"]);
    assert_eq!(ctx.bus.listener_count("x"), 3);
}

#[test]
fn test_events_emitted_during_replay_follow_the_backlog() {
    let ctx = isolated("a1");
    let log: Log = Rc::default();

    ctx.bus.buffer(&["x", "y"], "feat");
    ctx.bus.emit("x", sm("1"));
    ctx.bus.emit("y", sm("2"));

    let bus = ctx.bus.clone();
    let inner = Rc::clone(&log);
    ctx.registry.register(
        "x",
        Rc::new(move |event: &TelemetryEvent| {
            inner.borrow_mut().push(format!("x:{}", label(event)));
            bus.emit("y", sm("nested"));
            Ok(())
        }),
        Some("feat"),
        None,
    );
    ctx.registry.register("y", recorder(&log, "y"), Some("feat"), None);

    ctx.registry.drain("feat");
    assert_eq!(*log.borrow(), vec!["x:1", "y:2", "y:nested"]);
}

#[test]
fn test_drain_emits_lifecycle_event() {
    let ctx = isolated("a1");
    let log: Log = Rc::default();

    ctx.bus.on(&names::drained("feat"), recorder(&log, "life"));
    ctx.bus.buffer(&["x"], "feat");
    ctx.registry.drain("feat");

    assert_eq!(*log.borrow(), vec!["life:drained:feat"]);

    // Already drained: nothing replays and the lifecycle event is not repeated.
    ctx.bus.drain("feat");
    assert_eq!(log.borrow().len(), 1);
}

#[test]
fn test_drain_unknown_group_is_noop() {
    let ctx = isolated("a1");
    let log: Log = Rc::default();
    ctx.bus.on(&names::drained("ghost"), recorder(&log, "life"));

    ctx.registry.drain("ghost");
    ctx.bus.drain("ghost");

    assert!(log.borrow().is_empty());
    assert!(!ctx.bus.is_buffering("ghost"));
}

#[test]
fn test_drained_channel_never_buffers_again() {
    let ctx = isolated("a1");
    let log: Log = Rc::default();

    ctx.bus.buffer(&["x"], "feat");
    ctx.registry.register("x", recorder(&log, "x"), Some("feat"), None);
    ctx.registry.drain("feat");

    ctx.bus.buffer(&["x", "z"], "feat");
    assert!(!ctx.bus.is_buffering("feat"));
    ctx.bus.emit("x", sm("live"));
    assert_eq!(*log.borrow(), vec!["x:live"]);
}

#[test]
fn test_drain_gate_waits_for_every_participant() {
    let ctx = isolated("a1");
    let log: Log = Rc::default();

    ctx.bus.buffer(&["a-ev"], "a");
    ctx.bus.buffer(&["b-ev"], "b");
    ctx.registry.register("a-ev", recorder(&log, "a"), Some("a"), None);
    ctx.registry.register("b-ev", recorder(&log, "b"), Some("b"), None);
    ctx.registry.register_drain("a");
    ctx.registry.register_drain("b");

    ctx.bus.emit("b-ev", sm("1"));
    ctx.bus.emit("a-ev", sm("2"));

    ctx.registry.drain("a");
    assert!(log.borrow().is_empty());
    assert!(ctx.bus.is_buffering("a"));

    ctx.registry.drain("b");
    // Participants drain in registration order.
    assert_eq!(*log.borrow(), vec!["a:2", "b:1"]);
    assert!(!ctx.bus.is_buffering("a"));
    assert!(!ctx.bus.is_buffering("b"));
}

#[test]
fn test_abort_drops_backlog_and_silences_bus() {
    let ctx = isolated("a1");
    let log: Log = Rc::default();

    ctx.bus.on("live", recorder(&log, "live"));
    ctx.bus.buffer(&["x"], "feat");
    ctx.registry.register("x", recorder(&log, "x"), Some("feat"), None);
    ctx.bus.emit("x", sm("queued"));

    ctx.bus.abort();
    assert!(ctx.bus.is_aborted());
    assert_eq!(ctx.bus.backlog_len("feat"), 0);

    ctx.registry.drain("feat");
    ctx.bus.emit("live", sm("ignored"));
    assert!(log.borrow().is_empty());
}

#[test]
fn test_global_register_observes_every_instance() {
    let global = EventBus::new("shared");
    let first = AgentContext::with_global("a1", global.clone());
    let second = AgentContext::with_global("a2", global.clone());
    let log: Log = Rc::default();

    first.registry.global_register("seen", recorder(&log, "g"), Some("observer"));
    assert_eq!(global.listener_count("seen"), 1);

    first.global.emit("seen", sm("from-a1"));
    second.global.emit("seen", sm("from-a2"));
    // The instance bus is a different bus.
    second.bus.emit("seen", sm("local"));

    assert_eq!(*log.borrow(), vec!["g:from-a1", "g:from-a2"]);
}

#[test]
fn test_global_register_while_buffering_drains_global_bus() {
    let global = EventBus::new("shared");
    let ctx = AgentContext::with_global("a1", global.clone());
    let log: Log = Rc::default();

    global.buffer(&["g-ev"], "observer");
    ctx.registry.global_register("g-ev", recorder(&log, "g"), Some("observer"));
    global.emit("g-ev", sm("early"));
    assert!(log.borrow().is_empty());

    ctx.registry.drain("observer");
    assert_eq!(*log.borrow(), vec!["g:early"]);
    assert!(!global.is_buffering("observer"));
}

#[test]
fn test_instances_do_not_share_buses() {
    let first = isolated("a1");
    let second = isolated("a2");
    let log: Log = Rc::default();

    first.registry.register("x", recorder(&log, "first"), None, None);
    second.bus.emit("x", sm("other"));
    first.bus.emit("x", sm("mine"));

    assert_eq!(*log.borrow(), vec!["first:mine"]);
    assert!(!first.bus.same_bus(&second.bus));
    assert_eq!(first.bus.debug_id(), "a1");
}

#[test]
fn test_handle_delivers_live_without_opening_a_channel() {
    let ctx = isolated("a1");
    let log: Log = Rc::default();
    ctx.registry.register("late", recorder(&log, "late"), Some("late-feat"), None);

    ctx.handle("late", sm("1"));
    ctx.handle("unheard", sm("2"));

    assert_eq!(*log.borrow(), vec!["late:1"]);
    assert!(!ctx.bus.is_buffering("late-feat"));
    assert_eq!(ctx.bus.backlog_len("late-feat"), 0);
}

#[test]
fn test_handle_queues_on_channels_opened_at_install() {
    let ctx = isolated("a1");
    let log: Log = Rc::default();
    ctx.bus.buffer(&["early"], "feat");

    ctx.handle("early", sm("queued"));
    assert_eq!(ctx.bus.backlog_len("feat"), 1);

    ctx.registry.register("early", recorder(&log, "early"), Some("feat"), None);
    ctx.registry.drain("feat");
    assert_eq!(*log.borrow(), vec!["early:queued"]);
}
