use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;
use std::time::Duration;

use chrono::{TimeZone, Utc};
use serde_json::{json, Value};

use harvest_agent::config::AgentConfig;
use harvest_agent::harvest::{
    parse_retry_after, HarvestId, HarvestOptions, HarvestResult, Harvester, Payload, PayloadOptions,
    SubmitMethod,
};
use harvest_agent::kernel::aggregator::Attributes;
use harvest_agent::kernel::scheduler::{HarvestScheduler, PayloadSource, SchedulerOptions, SchedulerState};
use harvest_agent::kernel::time::Tick;

/// Hands out queued payloads and records what it was asked.
#[derive(Default)]
struct ScriptedSource {
    queue: VecDeque<Vec<Payload>>,
    asked: Vec<PayloadOptions>,
    results: Vec<(HarvestId, HarvestResult)>,
}

impl PayloadSource for ScriptedSource {
    fn get_payload(&mut self, opts: PayloadOptions) -> Vec<Payload> {
        self.asked.push(opts);
        self.queue.pop_front().unwrap_or_default()
    }

    fn on_finished(&mut self, harvest: HarvestId, result: &HarvestResult) {
        self.results.push((harvest, *result));
    }
}

fn body(value: Value) -> Payload {
    match value {
        Value::Object(map) => Payload::with_body(map),
        _ => Payload::default(),
    }
}

fn harvester() -> Harvester {
    let config = AgentConfig {
        license_key: "lk".into(),
        application_id: "42".into(),
        page_url: "https://example.test/".into(),
        ..AgentConfig::default()
    };
    Harvester::new(&config)
}

fn scheduler(
    payloads: Vec<Vec<Payload>>,
    opts: SchedulerOptions,
) -> (HarvestScheduler, Rc<RefCell<ScriptedSource>>) {
    let source = Rc::new(RefCell::new(ScriptedSource {
        queue: payloads.into(),
        ..Default::default()
    }));
    let dyn_source: Rc<RefCell<dyn PayloadSource>> = source.clone();
    (HarvestScheduler::new("jserrors", Some(dyn_source), opts), source)
}

fn secs(s: u64) -> Tick {
    Tick::from_secs(s)
}

#[test]
fn test_empty_harvest_reschedules_on_interval() {
    let h = harvester();
    let (mut sched, source) = scheduler(vec![], SchedulerOptions::default());

    sched.start_timer(secs(0), Duration::from_secs(10), None);
    assert_eq!(sched.next_harvest_at(), Some(secs(10)));
    assert!(sched.fire_if_due(Tick { ms: 9_999 }, &h).is_none());

    let run = sched.fire_if_due(secs(10), &h).expect("timer due");
    assert!(run.requests.is_empty());
    assert_eq!(sched.next_harvest_at(), Some(secs(20)));
    assert_eq!(source.borrow().asked, vec![PayloadOptions { retry: true, harvest: run.id }]);
    // No payloads were offered, so there is nothing to release.
    assert!(source.borrow().results.is_empty());
}

#[test]
fn test_initial_delay_overrides_first_interval() {
    let (mut sched, _) = scheduler(vec![], SchedulerOptions::default());
    sched.start_timer(secs(0), Duration::from_secs(10), Some(Duration::from_secs(2)));
    assert_eq!(sched.next_harvest_at(), Some(secs(2)));
    assert_eq!(sched.interval(), Duration::from_secs(10));
}

#[test]
fn test_schedule_harvest_is_idempotent() {
    let (mut sched, _) = scheduler(vec![], SchedulerOptions::default());
    assert_eq!(sched.state(), SchedulerState::Idle);

    assert!(sched.schedule_harvest(secs(0), Some(Duration::from_secs(5)), HarvestOptions::default()));
    assert!(!sched.schedule_harvest(secs(0), Some(Duration::from_secs(1)), HarvestOptions::default()));

    assert_eq!(sched.state(), SchedulerState::TimerPending);
    assert_eq!(sched.next_harvest_at(), Some(secs(5)));
}

#[test]
fn test_retry_delay_replaces_regular_timer_once() {
    let h = harvester();
    let (mut sched, source) = scheduler(vec![vec![body(json!({"err": []}))]], SchedulerOptions::default());

    sched.start_timer(secs(0), Duration::from_secs(10), None);
    let run = sched.fire_if_due(secs(10), &h).expect("due");
    assert_eq!(run.requests.len(), 1);
    assert_eq!(sched.next_harvest_at(), Some(secs(20)));

    let result = HarvestResult { sent: true, retry: true, delay: Some(Duration::from_secs(5)), status: Some(503) };
    sched.on_harvest_finished(secs(10), run.id, run.opts, &result);
    assert_eq!(sched.next_harvest_at(), Some(secs(15)));
    assert_eq!(source.borrow().results, vec![(run.id, result)]);

    sched.fire_if_due(secs(15), &h).expect("retry due");
    assert_eq!(sched.next_harvest_at(), Some(secs(25)));
}

#[test]
fn test_retry_without_delay_uses_fallback_or_keeps_cadence() {
    let h = harvester();
    let failure = HarvestResult::network_failure();

    let (mut plain, _) = scheduler(vec![vec![body(json!({"a": 1}))]], SchedulerOptions::default());
    plain.start_timer(secs(0), Duration::from_secs(10), None);
    let run = plain.fire_if_due(secs(10), &h).expect("due");
    plain.on_harvest_finished(secs(10), run.id, run.opts, &failure);
    assert_eq!(plain.next_harvest_at(), Some(secs(20)));

    let fallback = SchedulerOptions { retry_delay: Some(Duration::from_secs(3)) };
    let (mut eager, _) = scheduler(vec![vec![body(json!({"a": 1}))]], fallback);
    eager.start_timer(secs(0), Duration::from_secs(10), None);
    let run = eager.fire_if_due(secs(10), &h).expect("due");
    eager.on_harvest_finished(secs(10), run.id, run.opts, &failure);
    assert_eq!(eager.next_harvest_at(), Some(secs(13)));
}

#[test]
fn test_unsent_or_final_results_do_not_reschedule() {
    let h = harvester();
    let (mut sched, _) = scheduler(vec![vec![body(json!({"a": 1}))]], SchedulerOptions::default());
    sched.start_timer(secs(0), Duration::from_secs(10), None);
    let run = sched.fire_if_due(secs(10), &h).expect("due");

    let not_sent = HarvestResult { retry: true, delay: Some(Duration::from_secs(1)), ..HarvestResult::not_sent() };
    sched.on_harvest_finished(secs(10), run.id, run.opts, &not_sent);
    assert_eq!(sched.next_harvest_at(), Some(secs(20)));

    sched.on_harvest_finished(secs(10), run.id, run.opts, &HarvestResult::delivered(200));
    assert_eq!(sched.next_harvest_at(), Some(secs(20)));
}

#[test]
fn test_unstarted_scheduler_gets_one_follow_up() {
    let h = harvester();
    let (mut sched, source) = scheduler(
        vec![vec![body(json!({"a": 1}))], vec![body(json!({"a": 2}))]],
        SchedulerOptions::default(),
    );

    let run = sched.run_harvest(secs(0), HarvestOptions::default(), &h);
    assert_eq!(run.requests.len(), 1);
    assert_eq!(sched.state(), SchedulerState::Idle);

    let retry = HarvestResult::from_status(429, Duration::from_secs(5));
    sched.on_harvest_finished(secs(0), run.id, run.opts, &retry);
    assert_eq!(sched.next_harvest_at(), Some(secs(5)));

    let follow_up = sched.fire_if_due(secs(5), &h).expect("follow-up due");
    assert_eq!(follow_up.requests.len(), 1);
    assert_ne!(follow_up.id, run.id);
    assert_eq!(sched.state(), SchedulerState::Idle);
    assert_eq!(source.borrow().asked.len(), 2);
}

#[test]
fn test_stop_timer_clears_pending_and_late_results() {
    let h = harvester();
    let (mut sched, source) = scheduler(vec![vec![body(json!({"a": 1}))]], SchedulerOptions::default());
    sched.start_timer(secs(0), Duration::from_secs(10), None);
    let run = sched.fire_if_due(secs(10), &h).expect("due");

    sched.stop_timer();
    assert!(!sched.is_started());
    assert!(sched.is_stopped());
    assert_eq!(sched.state(), SchedulerState::Idle);

    // The in-flight send still reports back, but nothing is re-armed.
    sched.on_harvest_finished(secs(11), run.id, run.opts, &HarvestResult::from_status(429, Duration::from_secs(1)));
    assert_eq!(sched.state(), SchedulerState::Idle);
    assert_eq!(source.borrow().results.len(), 1);

    sched.start_timer(secs(12), Duration::from_secs(10), None);
    assert!(!sched.is_stopped());
    assert_eq!(sched.next_harvest_at(), Some(secs(22)));
}

#[test]
fn test_each_payload_becomes_its_own_send() {
    let h = harvester();
    let (mut sched, _) = scheduler(
        vec![vec![body(json!({"a": 1})), Payload::default(), body(json!({"b": 2}))]],
        SchedulerOptions::default(),
    );

    let requests = sched.run_harvest(secs(0), HarvestOptions::default(), &h).requests;
    assert_eq!(requests.len(), 2);
    assert_eq!(requests[0].body, r#"{"a":1}"#);
    assert_eq!(requests[1].body, r#"{"b":2}"#);
    assert_eq!(requests[0].url, "https://bam.nr-data.net/jserrors/1/lk");
    assert!(requests[0].query.contains(&("a".to_string(), "42".to_string())));
    assert!(requests[0].query.contains(&("ref".to_string(), "https://example.test/".to_string())));
}

#[test]
fn test_unload_disables_retry_snapshot_and_uses_beacon() {
    let h = harvester();
    let (mut sched, source) = scheduler(vec![vec![body(json!({"a": 1}))]], SchedulerOptions::default());

    let run = sched.run_harvest(secs(0), HarvestOptions::unload(), &h);
    assert_eq!(run.requests.len(), 1);
    assert_eq!(run.requests[0].method, SubmitMethod::Beacon);
    assert_eq!(source.borrow().asked, vec![PayloadOptions { retry: false, harvest: run.id }]);
}

#[test]
fn test_shared_endpoint_merges_contributors() {
    let mut h = harvester();
    let mut sched = HarvestScheduler::new("jserrors", None, SchedulerOptions::default());
    assert!(sched.run_harvest(secs(0), HarvestOptions::default(), &h).requests.is_empty());

    h.on(
        "jserrors",
        Rc::new(|_: &HarvestOptions| {
            let mut qs = std::collections::BTreeMap::new();
            qs.insert("ct".to_string(), "1".to_string());
            let mut body = Attributes::new();
            body.insert("sm".into(), json!([1]));
            Some(Payload { qs, body })
        }),
    );
    h.on("jserrors", Rc::new(|_: &HarvestOptions| None));
    h.on(
        "jserrors",
        Rc::new(|opts: &HarvestOptions| {
            let mut body = Attributes::new();
            body.insert("unload".into(), json!(opts.unload));
            Some(Payload::with_body(body))
        }),
    );
    assert_eq!(h.contributor_count("jserrors"), 3);

    let requests = sched.run_harvest(secs(0), HarvestOptions::unload(), &h).requests;
    assert_eq!(requests.len(), 1);
    let sent: Value = serde_json::from_str(&requests[0].body).expect("json body");
    assert_eq!(sent, json!({"sm": [1], "unload": true}));
    assert!(requests[0].query.contains(&("ct".to_string(), "1".to_string())));
}

#[test]
fn test_status_classification() {
    let tmr = Duration::from_secs(60);

    let ok = HarvestResult::from_status(200, tmr);
    assert!(ok.sent && !ok.retry);

    let throttled = HarvestResult::from_status(429, tmr);
    assert!(throttled.retry);
    assert_eq!(throttled.delay, Some(tmr));

    for status in [408, 500, 502, 503, 504, 512, 530] {
        let result = HarvestResult::from_status(status, tmr);
        assert!(result.retry, "{} should retry", status);
        assert_eq!(result.delay, None);
    }
    for status in [400, 404, 501, 505, 511, 531] {
        assert!(!HarvestResult::from_status(status, tmr).retry, "{} should not retry", status);
    }
}

#[test]
fn test_offered_but_empty_payloads_release_the_harvest() {
    let h = harvester();
    let (mut sched, source) = scheduler(vec![vec![Payload::default()]], SchedulerOptions::default());

    let run = sched.run_harvest(secs(0), HarvestOptions::default(), &h);
    assert!(run.requests.is_empty());
    assert_eq!(source.borrow().results, vec![(run.id, HarvestResult::not_sent())]);
}

#[test]
fn test_retry_after_accepts_seconds_and_http_dates() {
    let now = Utc.with_ymd_and_hms(2015, 10, 21, 7, 28, 0).single().expect("valid time");

    assert_eq!(parse_retry_after("120", now), Some(Duration::from_secs(120)));
    assert_eq!(parse_retry_after(" 0 ", now), Some(Duration::ZERO));
    assert_eq!(
        parse_retry_after("Wed, 21 Oct 2015 07:29:30 GMT", now),
        Some(Duration::from_secs(90))
    );
    // A date in the past means the server is ready now.
    assert_eq!(parse_retry_after("Wed, 21 Oct 2015 07:00:00 GMT", now), Some(Duration::ZERO));

    assert_eq!(parse_retry_after("soon", now), None);
    assert_eq!(parse_retry_after("-5", now), None);
}
