//! Rule registry and evaluation driver for one host.

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};

use futures::future::join_all;
use qwatch_common::types::{now_millis, MetricSample, Timestamp};
use qwatch_notify::NotificationDispatcher;

use crate::aggregation::AggregatorConfig;
use crate::alerter::{
    AlertQuery, AlertStore, CheckStatus, LeaderLock, RuleAlert, RuleAlertState, RuleAlerter,
    RuleStatusChange,
};
use crate::conditions::{ConditionEvaluator, EvaluationContext};
use crate::error::{AlertError, Result};
use crate::events::{EventBus, RuleEvent};
use crate::history::MetricHistory;
use crate::metrics::{MetricRegistry, MetricSnapshot};
use crate::rule::Rule;

/// Default raw-history retention when no rule asks for more.
const DEFAULT_HISTORY_RETENTION_MS: i64 = 60 * 60 * 1000;

struct RulePipeline {
    evaluator: Mutex<ConditionEvaluator>,
    alerter: Arc<RuleAlerter>,
}

#[derive(Default)]
struct Registry {
    rules: HashMap<String, Arc<Rule>>,
    /// metric id -> ids of the rules watching it
    index: HashMap<String, BTreeSet<String>>,
    pipelines: HashMap<String, Arc<RulePipeline>>,
}

impl Registry {
    fn insert(&mut self, rule: Rule) -> Option<Arc<RulePipeline>> {
        let old = self.remove(&rule.id);
        self.index
            .entry(rule.metric_id.clone())
            .or_default()
            .insert(rule.id.clone());
        self.rules.insert(rule.id.clone(), Arc::new(rule));
        old
    }

    /// Drops a rule and returns its pipeline, if one was built.
    fn remove(&mut self, rule_id: &str) -> Option<Arc<RulePipeline>> {
        if let Some(rule) = self.rules.remove(rule_id) {
            if let Some(ids) = self.index.get_mut(&rule.metric_id) {
                ids.remove(rule_id);
                if ids.is_empty() {
                    self.index.remove(&rule.metric_id);
                }
            }
        }
        self.pipelines.remove(rule_id)
    }
}

/// Per-rule outcome counts of one [`RuleManager::process_snapshot`] call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProcessSummary {
    pub evaluated: usize,
    pub opened: usize,
    pub closed: usize,
    pub failed: usize,
    pub removed: usize,
}

/// Owns every rule of a host: keeps the metric index, builds each rule's
/// evaluator and alerter on first use, and feeds metric snapshots through
/// them.
pub struct RuleManager {
    host_id: String,
    store: Arc<dyn AlertStore>,
    dispatcher: Arc<dyn NotificationDispatcher>,
    bus: EventBus,
    leader: LeaderLock,
    registry: RwLock<Registry>,
    metrics: Mutex<MetricRegistry>,
    history: Arc<RwLock<MetricHistory>>,
}

impl RuleManager {
    pub fn new(
        host_id: impl Into<String>,
        store: Arc<dyn AlertStore>,
        dispatcher: Arc<dyn NotificationDispatcher>,
        bus: EventBus,
        leader: LeaderLock,
    ) -> Self {
        Self {
            host_id: host_id.into(),
            store,
            dispatcher,
            bus,
            leader,
            registry: RwLock::new(Registry::default()),
            metrics: Mutex::new(MetricRegistry::new()),
            history: Arc::new(RwLock::new(MetricHistory::new(DEFAULT_HISTORY_RETENTION_MS))),
        }
    }

    pub fn with_history_retention(self, retention_ms: i64) -> Self {
        self.history_mut().ensure_retention(retention_ms);
        self
    }

    pub fn host_id(&self) -> &str {
        &self.host_id
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    pub fn set_has_lock(&self, held: bool) {
        if self.leader.is_held() != held {
            tracing::info!(host_id = %self.host_id, held, "leadership changed");
        }
        self.leader.set(held);
    }

    pub fn has_lock(&self) -> bool {
        self.leader.is_held()
    }

    fn registry(&self) -> RwLockReadGuard<'_, Registry> {
        self.registry.read().unwrap_or_else(|p| p.into_inner())
    }

    fn registry_mut(&self) -> RwLockWriteGuard<'_, Registry> {
        self.registry.write().unwrap_or_else(|p| p.into_inner())
    }

    fn metrics(&self) -> MutexGuard<'_, MetricRegistry> {
        self.metrics.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn history(&self) -> RwLockReadGuard<'_, MetricHistory> {
        self.history.read().unwrap_or_else(|p| p.into_inner())
    }

    fn history_mut(&self) -> RwLockWriteGuard<'_, MetricHistory> {
        self.history.write().unwrap_or_else(|p| p.into_inner())
    }

    // Metrics

    pub fn register_metric(&self, metric_id: &str, config: AggregatorConfig) {
        tracing::debug!(metric_id, aggregator = config.kind(), "metric registered");
        self.metrics().register(metric_id, config);
    }

    pub fn unregister_metric(&self, metric_id: &str) -> bool {
        self.history_mut().remove(metric_id);
        self.metrics().unregister(metric_id)
    }

    pub fn metric_ids(&self) -> Vec<String> {
        self.metrics()
            .metric_ids()
            .into_iter()
            .map(str::to_string)
            .collect()
    }

    /// Folds a raw sample into its aggregator and the raw history. Returns
    /// `MetricNotFound` for an unregistered metric.
    pub fn ingest(&self, sample: &MetricSample) -> Result<f64> {
        let value = self
            .metrics()
            .ingest(sample)
            .ok_or_else(|| AlertError::MetricNotFound(sample.metric_id.clone()))?;
        self.history_mut().push(sample);
        Ok(value)
    }

    pub fn snapshot(&self, ts: Timestamp) -> MetricSnapshot {
        self.metrics().snapshot(ts)
    }

    // Evaluation

    fn pipeline(&self, rule_id: &str) -> Option<Arc<RulePipeline>> {
        if let Some(pipeline) = self.registry().pipelines.get(rule_id) {
            return Some(pipeline.clone());
        }
        let mut registry = self.registry_mut();
        let rule = registry.rules.get(rule_id)?.clone();
        let pipeline = registry
            .pipelines
            .entry(rule_id.to_string())
            .or_insert_with(|| {
                Arc::new(RulePipeline {
                    evaluator: Mutex::new(ConditionEvaluator::new(&rule.condition)),
                    alerter: RuleAlerter::new(
                        rule.clone(),
                        self.host_id.clone(),
                        self.store.clone(),
                        self.dispatcher.clone(),
                        self.bus.clone(),
                        self.leader.clone(),
                    ),
                })
            });
        Some(pipeline.clone())
    }

    /// Evaluates every rule watching a metric in `snapshot`, concurrently
    /// across rules. Store failures are logged and retried on the next
    /// snapshot; rules the store no longer knows are dropped locally.
    pub async fn process_snapshot(&self, snapshot: &MetricSnapshot) -> ProcessSummary {
        let ts = snapshot.timestamp;
        let mut work = Vec::new();
        {
            let registry = self.registry();
            for (metric_id, value) in &snapshot.values {
                if let Some(ids) = registry.index.get(metric_id) {
                    work.extend(ids.iter().map(|id| (id.clone(), metric_id.as_str(), value)));
                }
            }
        }

        let tasks = work.into_iter().filter_map(|(rule_id, metric_id, value)| {
            let pipeline = self.pipeline(&rule_id)?;
            Some(async move {
                let result = {
                    let history = self.history();
                    let ctx = EvaluationContext {
                        metric_id,
                        history: &history,
                    };
                    let mut evaluator = pipeline.evaluator.lock().unwrap_or_else(|p| p.into_inner());
                    evaluator.evaluate(&ctx, ts, value)
                };
                let status = pipeline.alerter.handle(&result, ts).await;
                (rule_id, status)
            })
        });
        let outcomes = join_all(tasks.collect::<Vec<_>>()).await;

        let mut summary = ProcessSummary::default();
        for (rule_id, outcome) in outcomes {
            summary.evaluated += 1;
            match outcome {
                Ok(CheckStatus::Open) => summary.opened += 1,
                Ok(CheckStatus::Close) => summary.closed += 1,
                Ok(CheckStatus::NotFound) => {
                    tracing::warn!(rule_id = %rule_id, "rule no longer in store, removing");
                    self.teardown(&rule_id);
                    summary.removed += 1;
                }
                Ok(_) => {}
                Err(e) => {
                    tracing::warn!(rule_id = %rule_id, error = %e, "rule evaluation failed");
                    summary.failed += 1;
                }
            }
        }
        summary
    }

    /// Last circuit state the rule's alerter received from the store.
    pub async fn rule_state(&self, rule_id: &str) -> Option<RuleAlertState> {
        let pipeline = self.registry().pipelines.get(rule_id).cloned()?;
        Some(pipeline.alerter.state().await)
    }

    fn install(&self, rule: Rule) {
        let span = rule.condition.history_span();
        if span > 0 {
            let mut history = self.history_mut();
            history.ensure_retention(span * 2);
            history.ensure_depth(rule.condition.history_depth());
        }
        if let Some(old) = self.registry_mut().insert(rule) {
            old.alerter.destroy();
        }
    }

    fn teardown(&self, rule_id: &str) -> bool {
        let mut registry = self.registry_mut();
        let known = registry.rules.contains_key(rule_id);
        if let Some(pipeline) = registry.remove(rule_id) {
            pipeline.alerter.destroy();
        }
        known
    }

    // Rules

    pub async fn add_rule(&self, rule: Rule) -> Result<Rule> {
        rule.check()?;
        let known = self.registry().rules.contains_key(&rule.id);
        if known || self.store.get_rule(&rule.id).await?.is_some() {
            return Err(AlertError::RuleExists(rule.id));
        }
        let saved = self.store.save_rule(&self.host_id, &rule, now_millis()).await?;
        self.install(saved.clone());
        tracing::info!(rule_id = %saved.id, metric_id = %saved.metric_id, "rule added");
        self.bus.publish(RuleEvent::RuleAdded(Box::new(saved.clone())));
        Ok(saved)
    }

    /// Replaces a rule's definition. Its evaluator restarts; its circuit,
    /// held by the store, carries over.
    pub async fn update_rule(&self, rule: Rule) -> Result<Rule> {
        rule.check()?;
        if self.store.get_rule(&rule.id).await?.is_none() {
            return Err(AlertError::RuleNotFound(rule.id));
        }
        let saved = self.store.save_rule(&self.host_id, &rule, now_millis()).await?;
        self.install(saved.clone());
        tracing::info!(rule_id = %saved.id, "rule updated");
        self.bus.publish(RuleEvent::RuleUpdated(Box::new(saved.clone())));
        Ok(saved)
    }

    pub async fn delete_rule(&self, rule_id: &str) -> Result<bool> {
        let removed = self.store.delete_rule(rule_id).await?;
        let known = self.teardown(rule_id);
        if removed || known {
            tracing::info!(rule_id = %rule_id, "rule deleted");
            self.bus.publish(RuleEvent::RuleDeleted {
                rule_id: rule_id.to_string(),
            });
        }
        Ok(removed)
    }

    pub async fn get_rule(&self, rule_id: &str) -> Result<Option<Rule>> {
        self.store.get_rule(rule_id).await
    }

    pub async fn list_rules(&self) -> Result<Vec<Rule>> {
        self.store.list_rules(&self.host_id).await
    }

    pub async fn set_rule_status(&self, rule_id: &str, active: bool) -> Result<RuleStatusChange> {
        let ts = now_millis();
        let change = if active {
            self.store.activate_rule(rule_id, ts).await?
        } else {
            self.store.deactivate_rule(rule_id, ts).await?
        };
        match change {
            RuleStatusChange::NotFound => {
                self.teardown(rule_id);
            }
            RuleStatusChange::Activated | RuleStatusChange::Deactivated => {
                {
                    let mut registry = self.registry_mut();
                    if let Some(rule) = registry.rules.get_mut(rule_id) {
                        Arc::make_mut(rule).is_active = active;
                    }
                }
                let rule_id = rule_id.to_string();
                tracing::info!(rule_id = %rule_id, active, "rule status changed");
                self.bus.publish(if active {
                    RuleEvent::RuleActivated { rule_id }
                } else {
                    RuleEvent::RuleDeactivated { rule_id }
                });
            }
            RuleStatusChange::Unchanged => {}
        }
        Ok(change)
    }

    /// Replaces the local registry with the host's rules from the store.
    pub async fn load_rules(&self) -> Result<usize> {
        let rules = self.store.list_rules(&self.host_id).await?;
        let stale: Vec<String> = {
            let registry = self.registry();
            registry
                .rules
                .keys()
                .filter(|id| !rules.iter().any(|r| &r.id == *id))
                .cloned()
                .collect()
        };
        for rule_id in stale {
            self.teardown(&rule_id);
        }
        let count = rules.len();
        for rule in rules {
            self.install(rule);
        }
        tracing::info!(host_id = %self.host_id, count, "rules loaded");
        Ok(count)
    }

    pub fn rule_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.registry().rules.keys().cloned().collect();
        ids.sort();
        ids
    }

    // Alerts

    pub async fn get_alerts(&self, rule_id: &str, query: &AlertQuery) -> Result<Vec<RuleAlert>> {
        self.store.get_alerts(rule_id, query).await
    }

    pub async fn get_alert(&self, rule_id: &str, alert_id: &str) -> Result<Option<RuleAlert>> {
        self.store.get_alert(rule_id, alert_id).await
    }

    pub async fn delete_alert(&self, rule_id: &str, alert_id: &str) -> Result<bool> {
        self.store.delete_alert(rule_id, alert_id).await
    }

    pub async fn mark_alert_read(&self, rule_id: &str, alert_id: &str) -> Result<bool> {
        self.store.mark_alert_read(rule_id, alert_id).await
    }

    /// Closes an alert by hand. `Ok(false)` when it was already closed.
    pub async fn reset_alert(&self, rule_id: &str, alert_id: &str) -> Result<bool> {
        let ts = now_millis();
        if let Some(pipeline) = self.pipeline(rule_id) {
            let reset = pipeline.alerter.reset_alert(alert_id, ts).await?;
            if reset {
                tracing::info!(rule_id = %rule_id, alert_id = %alert_id, "alert reset");
            }
            return Ok(reset);
        }
        // Rule no longer registered here: close the record without notifying.
        let reset = self.store.reset_alert(rule_id, alert_id, ts).await?;
        if reset {
            tracing::info!(rule_id = %rule_id, alert_id = %alert_id, "alert reset");
            self.bus.publish(RuleEvent::AlertReset {
                rule_id: rule_id.to_string(),
                alert_id: alert_id.to_string(),
                reset_at: ts,
            });
        }
        Ok(reset)
    }

    /// Deletes closed alerts raised more than `retention_ms` before `now`.
    pub async fn prune_alerts(&self, retention_ms: i64, now: Timestamp) -> Result<u64> {
        let pruned = self.store.prune_alerts(now - retention_ms).await?;
        if pruned > 0 {
            tracing::info!(pruned, "closed alerts pruned");
        }
        Ok(pruned)
    }

    pub async fn queue_alert_count(&self, queue_id: &str) -> Result<u64> {
        self.store.queue_alert_count(queue_id).await
    }

    pub async fn host_alert_count(&self) -> Result<u64> {
        self.store.host_alert_count(&self.host_id).await
    }

    /// Stops every alerter's watchdog and forgets all rules.
    pub fn shutdown(&self) {
        let mut registry = self.registry_mut();
        for pipeline in registry.pipelines.values() {
            pipeline.alerter.destroy();
        }
        *registry = Registry::default();
    }
}
