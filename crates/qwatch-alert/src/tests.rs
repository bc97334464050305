use crate::aggregation::AggregatorConfig;
use crate::alerter::{
    AlertQuery, AlertStatus, AlertStore, CheckStatus, CircuitState, LeaderLock,
    MemoryAlertStore, RuleAlerter, RuleStatusChange,
};
use crate::conditions::peak::{PeakCondition, PeakDirection};
use crate::conditions::threshold::{CompareOp, ThresholdCondition};
use crate::conditions::{ErrorLevel, EvaluationResult, RuleCondition, RuleEvaluationState};
use crate::error::AlertError;
use crate::events::{EventBus, RuleEvent};
use crate::manager::RuleManager;
use crate::rule::{AlertOptions, Rule, RuleState};
use async_trait::async_trait;
use qwatch_common::types::{now_millis, MetricSample, NotificationEvent, TemplateContext};
use qwatch_notify::{DispatchSummary, NotificationDispatcher};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::broadcast;

#[derive(Default)]
struct RecordingDispatcher {
    sent: Mutex<Vec<(NotificationEvent, TemplateContext)>>,
}

impl RecordingDispatcher {
    fn events(&self) -> Vec<NotificationEvent> {
        self.sent.lock().unwrap().iter().map(|(e, _)| *e).collect()
    }

    fn last_context(&self) -> TemplateContext {
        self.sent.lock().unwrap().last().unwrap().1.clone()
    }
}

#[async_trait]
impl NotificationDispatcher for RecordingDispatcher {
    async fn dispatch(
        &self,
        event: NotificationEvent,
        context: &TemplateContext,
        channels: &[String],
    ) -> DispatchSummary {
        self.sent.lock().unwrap().push((event, context.clone()));
        DispatchSummary {
            delivered: channels.len(),
            ..DispatchSummary::default()
        }
    }
}

fn wait_rule(id: &str, options: AlertOptions) -> Rule {
    Rule::new(
        id,
        "Queue wait time",
        "queue.wait",
        RuleCondition::Threshold(ThresholdCondition {
            operator: CompareOp::Gt,
            error_threshold: 100.0,
            warning_threshold: Some(50.0),
            unit: Some("ms".into()),
            reduction: Default::default(),
        }),
    )
    .with_options(options)
    .with_channels(vec!["ops".into()])
    .with_queue("q1")
}

fn evaluation(value: f64) -> EvaluationResult {
    let level = if value > 100.0 {
        ErrorLevel::Critical
    } else if value > 50.0 {
        ErrorLevel::Warning
    } else {
        ErrorLevel::None
    };
    EvaluationResult::new(
        value,
        level,
        RuleEvaluationState::Threshold {
            comparator: CompareOp::Gt,
            error_threshold: 100.0,
            warning_threshold: Some(50.0),
            value,
            unit: Some("ms".into()),
        },
    )
}

struct Fixture {
    store: Arc<MemoryAlertStore>,
    dispatcher: Arc<RecordingDispatcher>,
    bus: EventBus,
    alerter: Arc<RuleAlerter>,
}

async fn fixture(options: AlertOptions, leader: bool) -> Fixture {
    let store = Arc::new(MemoryAlertStore::new());
    let dispatcher = Arc::new(RecordingDispatcher::default());
    let bus = EventBus::default();
    let rule = store
        .save_rule("h1", &wait_rule("r1", options), 0)
        .await
        .unwrap();
    let alerter = RuleAlerter::new(
        Arc::new(rule),
        "h1",
        store.clone(),
        dispatcher.clone(),
        bus.clone(),
        LeaderLock::new(leader),
    );
    Fixture {
        store,
        dispatcher,
        bus,
        alerter,
    }
}

fn drain(rx: &mut broadcast::Receiver<RuleEvent>) -> Vec<&'static str> {
    let mut names = Vec::new();
    while let Ok(event) = rx.try_recv() {
        names.push(event.name());
    }
    names
}

#[tokio::test]
async fn open_edge_writes_alert_and_notifies() {
    let f = fixture(AlertOptions::default(), true).await;
    let mut rx = f.bus.subscribe();

    let status = f.alerter.handle(&evaluation(150.0), 1000).await.unwrap();
    assert_eq!(status, CheckStatus::Open);

    let alerts = f.store.get_alerts("r1", &AlertQuery::default()).await.unwrap();
    assert_eq!(alerts.len(), 1);
    let alert = &alerts[0];
    assert_eq!(alert.status, AlertStatus::Open);
    assert_eq!(alert.title, "[CRITICAL] Queue wait time");
    assert_eq!(alert.message, "queue.wait is 150.00ms (> 100.00ms)");
    assert_eq!(alert.raised_at, 1000);

    assert_eq!(f.dispatcher.events(), vec![NotificationEvent::AlertTriggered]);
    let ctx = f.dispatcher.last_context();
    assert_eq!(ctx["alert_id"], alert.id.as_str());
    assert_eq!(ctx["rule_name"], "Queue wait time");
    assert_eq!(ctx["alert_count"], 1);

    assert_eq!(drain(&mut rx), vec!["alert.triggered", "rule.state-changed"]);
    let mirror = f.alerter.state().await;
    assert_eq!(mirror.circuit_state, CircuitState::Open);
    assert_eq!(mirror.alert_id.as_deref(), Some(alert.id.as_str()));
}

#[tokio::test]
async fn follower_only_mirrors_the_store() {
    let f = fixture(AlertOptions::default(), false).await;
    let status = f.alerter.handle(&evaluation(150.0), 1000).await.unwrap();
    assert_eq!(status, CheckStatus::Standby);
    assert!(f
        .store
        .get_alerts("r1", &AlertQuery::default())
        .await
        .unwrap()
        .is_empty());
    assert!(f.dispatcher.events().is_empty());
    let stored = f.store.get_state("r1", 1000).await.unwrap().unwrap();
    assert_eq!(stored.total_failures, 0);
    assert_eq!(f.alerter.state().await.circuit_state, CircuitState::Closed);
}

/// Two replicas of one rule sharing a store, in either evaluation order.
async fn replicas_tick(leader_first: bool) {
    let options = AlertOptions {
        failure_threshold: 2,
        ..AlertOptions::default()
    };
    let leader = fixture(options, true).await;
    let follower = RuleAlerter::new(
        leader.alerter.rule().clone(),
        "h2",
        leader.store.clone(),
        leader.dispatcher.clone(),
        leader.bus.clone(),
        LeaderLock::new(false),
    );

    let mut statuses = Vec::new();
    for ts in [1000, 2000] {
        let (first, second) = if leader_first {
            (&leader.alerter, &follower)
        } else {
            (&follower, &leader.alerter)
        };
        let a = first.handle(&evaluation(150.0), ts).await.unwrap();
        let b = second.handle(&evaluation(150.0), ts).await.unwrap();
        statuses.push(if leader_first { (a, b) } else { (b, a) });
    }
    assert_eq!(statuses[0].0, CheckStatus::Failure);
    assert_eq!(statuses[1].0, CheckStatus::Open);
    assert!(statuses.iter().all(|(_, f)| *f == CheckStatus::Standby));

    let stored = leader.store.get_state("r1", 2000).await.unwrap().unwrap();
    assert_eq!(stored.total_failures, 2);
    assert_eq!(stored.circuit_state, CircuitState::Open);
    let alerts = leader
        .store
        .get_alerts("r1", &AlertQuery::default())
        .await
        .unwrap();
    assert_eq!(alerts.len(), 1);
    assert_eq!(alerts[0].raised_at, 2000);
    assert_eq!(
        leader.dispatcher.events(),
        vec![NotificationEvent::AlertTriggered]
    );
}

#[tokio::test]
async fn only_leader_advances_shared_circuit() {
    replicas_tick(true).await;
    replicas_tick(false).await;
}

#[tokio::test]
async fn repeats_are_throttled_by_notify_interval() {
    let f = fixture(
        AlertOptions {
            notify_interval: 100,
            max_alerts_per_event: 10,
            ..AlertOptions::default()
        },
        true,
    )
    .await;
    for ts in [0, 20, 40] {
        f.alerter.handle(&evaluation(150.0), ts).await.unwrap();
    }
    assert_eq!(f.dispatcher.events(), vec![NotificationEvent::AlertTriggered]);

    f.alerter.handle(&evaluation(150.0), 100).await.unwrap();
    assert_eq!(
        f.dispatcher.events(),
        vec![NotificationEvent::AlertTriggered, NotificationEvent::AlertRepeated]
    );
    assert_eq!(f.dispatcher.last_context()["alert_count"], 2);
}

#[tokio::test]
async fn success_closes_and_notifies_reset() {
    let f = fixture(AlertOptions::default(), true).await;
    let mut rx = f.bus.subscribe();
    f.alerter.handle(&evaluation(150.0), 0).await.unwrap();
    let status = f.alerter.handle(&evaluation(10.0), 10).await.unwrap();
    assert_eq!(status, CheckStatus::Close);

    let alert = &f.store.get_alerts("r1", &AlertQuery::default()).await.unwrap()[0];
    assert_eq!(alert.status, AlertStatus::Close);
    assert_eq!(alert.reset_at, Some(10));
    assert_eq!(
        f.dispatcher.events(),
        vec![NotificationEvent::AlertTriggered, NotificationEvent::AlertReset]
    );
    assert_eq!(
        drain(&mut rx),
        vec![
            "alert.triggered",
            "rule.state-changed",
            "alert.reset",
            "rule.state-changed"
        ]
    );
    let mirror = f.alerter.state().await;
    assert_eq!(mirror.circuit_state, CircuitState::Closed);
    assert!(mirror.alert_id.is_none());
}

#[tokio::test]
async fn reset_notification_respects_alert_on_reset() {
    let f = fixture(
        AlertOptions {
            alert_on_reset: false,
            ..AlertOptions::default()
        },
        true,
    )
    .await;
    f.alerter.handle(&evaluation(150.0), 0).await.unwrap();
    f.alerter.handle(&evaluation(10.0), 10).await.unwrap();
    assert_eq!(f.dispatcher.events(), vec![NotificationEvent::AlertTriggered]);
}

#[tokio::test(start_paused = true)]
async fn watchdog_closes_after_recovery_window() {
    let f = fixture(
        AlertOptions {
            recovery_window: 100,
            ..AlertOptions::default()
        },
        true,
    )
    .await;
    f.alerter.handle(&evaluation(150.0), 0).await.unwrap();

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(f.alerter.state().await.circuit_state, CircuitState::Open);

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(f.alerter.state().await.circuit_state, CircuitState::Closed);
    let alert = &f.store.get_alerts("r1", &AlertQuery::default()).await.unwrap()[0];
    assert_eq!(alert.reset_at, Some(101));
    assert_eq!(
        f.dispatcher.events(),
        vec![NotificationEvent::AlertTriggered, NotificationEvent::AlertReset]
    );
}

#[tokio::test(start_paused = true)]
async fn failure_reschedules_watchdog() {
    let f = fixture(
        AlertOptions {
            recovery_window: 100,
            ..AlertOptions::default()
        },
        true,
    )
    .await;
    f.alerter.handle(&evaluation(150.0), 0).await.unwrap();
    f.alerter.handle(&evaluation(150.0), 50).await.unwrap();
    assert_eq!(f.alerter.state().await.end_delay_ts, Some(200));

    // The first deadline (101) must not fire.
    tokio::time::sleep(Duration::from_millis(120)).await;
    assert_eq!(f.alerter.state().await.circuit_state, CircuitState::Open);

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(f.alerter.state().await.circuit_state, CircuitState::Closed);
}

#[tokio::test(start_paused = true)]
async fn destroyed_alerter_ignores_watchdog() {
    let f = fixture(
        AlertOptions {
            recovery_window: 100,
            ..AlertOptions::default()
        },
        true,
    )
    .await;
    f.alerter.handle(&evaluation(150.0), 0).await.unwrap();
    f.alerter.destroy();
    tokio::time::sleep(Duration::from_millis(500)).await;

    let alert = &f.store.get_alerts("r1", &AlertQuery::default()).await.unwrap()[0];
    assert_eq!(alert.status, AlertStatus::Open);
    assert_eq!(f.dispatcher.events(), vec![NotificationEvent::AlertTriggered]);
    assert_eq!(
        f.alerter.handle(&evaluation(150.0), 600).await.unwrap(),
        CheckStatus::NotFound
    );
}

struct ManagerFixture {
    store: Arc<MemoryAlertStore>,
    dispatcher: Arc<RecordingDispatcher>,
    manager: RuleManager,
}

fn manager() -> ManagerFixture {
    let store = Arc::new(MemoryAlertStore::new());
    let dispatcher = Arc::new(RecordingDispatcher::default());
    let manager = RuleManager::new(
        "h1",
        store.clone(),
        dispatcher.clone(),
        EventBus::default(),
        LeaderLock::new(true),
    );
    manager.register_metric("queue.wait", AggregatorConfig::Identity);
    ManagerFixture {
        store,
        dispatcher,
        manager,
    }
}

#[tokio::test]
async fn manager_drives_rules_from_samples() {
    let m = manager();
    let mut rx = m.manager.bus().subscribe();
    m.manager
        .add_rule(wait_rule("r1", AlertOptions::default()))
        .await
        .unwrap();

    let t0 = now_millis();
    m.manager
        .ingest(&MetricSample::new("queue.wait", t0, 20.0))
        .unwrap();
    let summary = m.manager.process_snapshot(&m.manager.snapshot(t0)).await;
    assert_eq!(summary.evaluated, 1);
    assert_eq!(summary.opened, 0);

    m.manager
        .ingest(&MetricSample::new("queue.wait", t0 + 1000, 180.0))
        .unwrap();
    let summary = m.manager.process_snapshot(&m.manager.snapshot(t0 + 1000)).await;
    assert_eq!(summary.opened, 1);

    let state = m.manager.rule_state("r1").await.unwrap();
    assert_eq!(state.circuit_state, CircuitState::Open);
    let rule = m.manager.get_rule("r1").await.unwrap().unwrap();
    assert_eq!(rule.state, RuleState::Error);
    assert_eq!(rule.total_failures, 1);
    assert_eq!(m.manager.host_alert_count().await.unwrap(), 1);
    assert_eq!(m.manager.queue_alert_count("q1").await.unwrap(), 1);
    assert_eq!(m.dispatcher.events(), vec![NotificationEvent::AlertTriggered]);
    assert_eq!(drain(&mut rx)[0], "rule.added");
}

#[tokio::test]
async fn unregistered_metric_is_rejected() {
    let m = manager();
    let err = m
        .manager
        .ingest(&MetricSample::new("nope", 0, 1.0))
        .unwrap_err();
    assert!(matches!(err, AlertError::MetricNotFound(id) if id == "nope"));
}

#[tokio::test]
async fn rules_missing_from_store_are_torn_down() {
    let m = manager();
    m.manager
        .add_rule(wait_rule("r1", AlertOptions::default()))
        .await
        .unwrap();
    m.store.delete_rule("r1").await.unwrap();

    let t0 = now_millis();
    m.manager
        .ingest(&MetricSample::new("queue.wait", t0, 180.0))
        .unwrap();
    let summary = m.manager.process_snapshot(&m.manager.snapshot(t0)).await;
    assert_eq!(summary.removed, 1);
    assert!(m.manager.rule_ids().is_empty());
}

#[tokio::test]
async fn add_rule_validates_and_rejects_duplicates() {
    let m = manager();
    m.manager
        .add_rule(wait_rule("r1", AlertOptions::default()))
        .await
        .unwrap();
    let dup = m
        .manager
        .add_rule(wait_rule("r1", AlertOptions::default()))
        .await
        .unwrap_err();
    assert!(matches!(dup, AlertError::RuleExists(_)));

    let invalid = m
        .manager
        .add_rule(wait_rule(
            "r2",
            AlertOptions {
                failure_threshold: 0,
                ..AlertOptions::default()
            },
        ))
        .await
        .unwrap_err();
    assert!(matches!(invalid, AlertError::Validation(_)));
    assert!(m.manager.get_rule("r2").await.unwrap().is_none());

    let missing = m
        .manager
        .update_rule(wait_rule("r3", AlertOptions::default()))
        .await
        .unwrap_err();
    assert!(matches!(missing, AlertError::RuleNotFound(_)));
}

#[tokio::test]
async fn deactivated_rule_stays_quiet() {
    let m = manager();
    let mut rx = m.manager.bus().subscribe();
    m.manager
        .add_rule(wait_rule("r1", AlertOptions::default()))
        .await
        .unwrap();
    assert_eq!(
        m.manager.set_rule_status("r1", false).await.unwrap(),
        RuleStatusChange::Deactivated
    );

    let t0 = now_millis();
    m.manager
        .ingest(&MetricSample::new("queue.wait", t0, 180.0))
        .unwrap();
    let summary = m.manager.process_snapshot(&m.manager.snapshot(t0)).await;
    assert_eq!(summary.opened, 0);
    assert!(m.dispatcher.events().is_empty());
    assert_eq!(drain(&mut rx), vec!["rule.added", "rule.deactivated"]);

    let rule = m.manager.get_rule("r1").await.unwrap().unwrap();
    assert_eq!(rule.state, RuleState::Muted);
    assert_eq!(
        m.manager.set_rule_status("missing", true).await.unwrap(),
        RuleStatusChange::NotFound
    );
}

#[tokio::test]
async fn manual_reset_closes_incident() {
    let m = manager();
    m.manager
        .add_rule(wait_rule("r1", AlertOptions::default()))
        .await
        .unwrap();
    let t0 = now_millis();
    m.manager
        .ingest(&MetricSample::new("queue.wait", t0, 180.0))
        .unwrap();
    m.manager.process_snapshot(&m.manager.snapshot(t0)).await;

    let alert_id = m.manager.rule_state("r1").await.unwrap().alert_id.unwrap();
    let mut rx = m.manager.bus().subscribe();
    assert!(m.manager.reset_alert("r1", &alert_id).await.unwrap());
    assert!(!m.manager.reset_alert("r1", &alert_id).await.unwrap());
    let state = m.manager.rule_state("r1").await.unwrap();
    assert_eq!(state.circuit_state, CircuitState::Closed);
    assert_eq!(
        m.dispatcher.events(),
        vec![NotificationEvent::AlertTriggered, NotificationEvent::AlertReset]
    );
    assert_eq!(m.dispatcher.last_context()["alert_id"], alert_id.as_str());
    assert_eq!(drain(&mut rx), vec!["alert.reset", "rule.state-changed"]);

    let alerts = m
        .manager
        .get_alerts("r1", &AlertQuery::default())
        .await
        .unwrap();
    assert_eq!(alerts.len(), 1);
    assert!(!alerts[0].is_open());

    let pruned = m
        .manager
        .prune_alerts(0, alerts[0].raised_at + 1)
        .await
        .unwrap();
    assert_eq!(pruned, 1);
}

#[tokio::test]
async fn sparse_peak_baseline_survives_history_eviction() {
    const HOUR: i64 = 60 * 60 * 1000;
    let m = manager();
    let rule = Rule::new(
        "p1",
        "Queue wait spike",
        "queue.wait",
        RuleCondition::Peak(PeakCondition {
            lag: 3,
            deviations: 3.0,
            warning_deviations: None,
            influence: 0.0,
            window_size: HOUR,
            direction: PeakDirection::Above,
            trigger_window: None,
            threshold_fraction: None,
        }),
    )
    .with_channels(vec!["ops".into()]);
    m.manager.add_rule(rule).await.unwrap();

    // Baseline samples land well before the two-hour retention horizon.
    let base = now_millis();
    for (i, value) in [10.0, 11.0, 10.0, 100.0].into_iter().enumerate() {
        let ts = base + (i as i64 + 1) * 3 * HOUR;
        m.manager
            .ingest(&MetricSample::new("queue.wait", ts, value))
            .unwrap();
    }
    let ts = base + 12 * HOUR;
    let summary = m.manager.process_snapshot(&m.manager.snapshot(ts)).await;
    assert_eq!(summary.opened, 1);
    let state = m.manager.rule_state("p1").await.unwrap();
    assert_eq!(state.circuit_state, CircuitState::Open);
}

#[tokio::test]
async fn update_keeps_store_circuit() {
    let m = manager();
    m.manager
        .add_rule(wait_rule("r1", AlertOptions::default()))
        .await
        .unwrap();
    let t0 = now_millis();
    m.manager
        .ingest(&MetricSample::new("queue.wait", t0, 180.0))
        .unwrap();
    m.manager.process_snapshot(&m.manager.snapshot(t0)).await;

    let mut changed = wait_rule("r1", AlertOptions::default());
    changed.name = "Renamed".into();
    let saved = m.manager.update_rule(changed).await.unwrap();
    assert_eq!(saved.name, "Renamed");

    // Another failure is a repeat of the open incident, not a new one.
    m.manager
        .ingest(&MetricSample::new("queue.wait", t0 + 1000, 190.0))
        .unwrap();
    let summary = m.manager.process_snapshot(&m.manager.snapshot(t0 + 1000)).await;
    assert_eq!(summary.opened, 0);
    assert_eq!(m.manager.host_alert_count().await.unwrap(), 1);
}

#[tokio::test]
async fn load_rules_restores_registry() {
    let m = manager();
    m.store
        .save_rule("h1", &wait_rule("r1", AlertOptions::default()), 0)
        .await
        .unwrap();
    m.store
        .save_rule("h2", &wait_rule("other-host", AlertOptions::default()), 0)
        .await
        .unwrap();
    assert_eq!(m.manager.load_rules().await.unwrap(), 1);
    assert_eq!(m.manager.rule_ids(), vec!["r1".to_string()]);
    assert_eq!(m.manager.list_rules().await.unwrap().len(), 1);

    assert!(m.manager.delete_rule("r1").await.unwrap());
    assert!(m.manager.rule_ids().is_empty());
}
