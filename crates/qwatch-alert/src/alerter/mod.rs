//! Per-rule alert lifecycle.
//!
//! A [`RuleAlerter`] feeds every evaluation of its rule into the shared
//! [`AlertStore`], mirrors the store's answer, and acts on circuit edges:
//! it writes the alert record, asks the store whether a notification may be
//! sent, dispatches it, and publishes [`RuleEvent`]s. Circuit state itself is
//! never advanced locally, and only the [`LeaderLock`] holder advances it in
//! the store. Other replicas just read it.

pub mod memory;
pub mod message;
pub mod record;
pub mod store;
pub mod types;

pub use memory::MemoryAlertStore;
pub use record::RuleStateRecord;
pub use store::AlertStore;
pub use types::{
    AlertData, AlertQuery, AlertStatus, CheckAlertResponse, CheckStatus, CircuitState,
    NotifyDecision, RuleAlert, RuleAlertState, RuleStatusChange,
};

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use qwatch_common::types::{NotificationEvent, TemplateContext, Timestamp};
use qwatch_notify::NotificationDispatcher;
use serde_json::json;
use tokio::task::JoinHandle;

use crate::conditions::{ErrorLevel, EvaluationResult};
use crate::error::Result;
use crate::events::{EventBus, RuleEvent};
use crate::rule::{Rule, RuleState};

/// Leadership flag shared by every alerter of a process. Only the holder
/// advances circuits, writes alerts and sends notifications.
#[derive(Debug, Clone, Default)]
pub struct LeaderLock(Arc<AtomicBool>);

impl LeaderLock {
    pub fn new(held: bool) -> Self {
        Self(Arc::new(AtomicBool::new(held)))
    }

    pub fn is_held(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }

    pub fn set(&self, held: bool) {
        self.0.store(held, Ordering::Release);
    }
}

#[derive(Default)]
struct Watchdog {
    generation: u64,
    end: Option<Timestamp>,
    handle: Option<JoinHandle<()>>,
}

pub struct RuleAlerter {
    rule: Arc<Rule>,
    host_id: String,
    store: Arc<dyn AlertStore>,
    dispatcher: Arc<dyn NotificationDispatcher>,
    bus: EventBus,
    leader: LeaderLock,
    state: tokio::sync::Mutex<RuleAlertState>,
    watchdog: Mutex<Watchdog>,
    destroyed: AtomicBool,
}

impl RuleAlerter {
    pub fn new(
        rule: Arc<Rule>,
        host_id: impl Into<String>,
        store: Arc<dyn AlertStore>,
        dispatcher: Arc<dyn NotificationDispatcher>,
        bus: EventBus,
        leader: LeaderLock,
    ) -> Arc<Self> {
        Arc::new(Self {
            rule,
            host_id: host_id.into(),
            store,
            dispatcher,
            bus,
            leader,
            state: tokio::sync::Mutex::new(RuleAlertState::default()),
            watchdog: Mutex::new(Watchdog::default()),
            destroyed: AtomicBool::new(false),
        })
    }

    pub fn rule(&self) -> &Arc<Rule> {
        &self.rule
    }

    /// Last circuit state reported by the store.
    pub async fn state(&self) -> RuleAlertState {
        self.state.lock().await.clone()
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::Acquire)
    }

    /// Stops the watchdog. Later calls to [`handle`](Self::handle) and timer
    /// firings do nothing.
    pub fn destroy(&self) {
        self.destroyed.store(true, Ordering::Release);
        self.cancel_watchdog();
    }

    /// Feeds one evaluation to the store and acts on the resulting edge.
    pub async fn handle(self: &Arc<Self>, result: &EvaluationResult, ts: Timestamp) -> Result<CheckStatus> {
        if self.is_destroyed() {
            return Ok(CheckStatus::NotFound);
        }
        if !self.leader.is_held() {
            return self.follow(ts).await;
        }
        let mut mirror = self.state.lock().await;
        let resp = self
            .store
            .check_alert(&self.rule.id, result.error_level, ts)
            .await?;
        mirror.apply(&resp);
        if !matches!(resp.status, CheckStatus::Warmup | CheckStatus::Inactive) {
            mirror.error_status = if resp.status == CheckStatus::Close {
                ErrorLevel::None
            } else {
                result.error_level
            };
        }

        match resp.status {
            CheckStatus::Open => {
                self.sync_watchdog(&mirror, ts);
                self.on_open(&resp, result, ts).await?;
            }
            CheckStatus::Failure if resp.circuit_state.is_circuit_tripped() => {
                self.sync_watchdog(&mirror, ts);
                if resp.notify {
                    self.on_repeat(&resp, result, ts).await?;
                }
            }
            CheckStatus::Close => {
                self.cancel_watchdog();
                if let Some(alert_id) = resp.alert_id.as_deref() {
                    self.on_close(alert_id, ts, true).await?;
                }
            }
            CheckStatus::NotFound => {
                self.cancel_watchdog();
                tracing::warn!(rule_id = %self.rule.id, "rule missing from alert store");
            }
            _ => self.sync_watchdog(&mirror, ts),
        }
        Ok(resp.status)
    }

    /// Replica path: mirrors the store without counting the evaluation.
    async fn follow(&self, ts: Timestamp) -> Result<CheckStatus> {
        let mut mirror = self.state.lock().await;
        self.cancel_watchdog();
        match self.store.peek_state(&self.rule.id, ts).await? {
            Some(state) => {
                *mirror = state;
                Ok(CheckStatus::Standby)
            }
            None => {
                *mirror = RuleAlertState::default();
                Ok(CheckStatus::NotFound)
            }
        }
    }

    /// Refreshes the mirror from the store, handling an auto-close the read
    /// applied. `None` when the store no longer knows the rule.
    pub async fn check_state(self: &Arc<Self>, ts: Timestamp) -> Result<Option<RuleAlertState>> {
        let mut mirror = self.state.lock().await;
        let Some(state) = self.store.get_state(&self.rule.id, ts).await? else {
            *mirror = RuleAlertState::default();
            self.cancel_watchdog();
            return Ok(None);
        };
        *mirror = state.clone();
        match state.closed_alert_id.as_deref() {
            Some(alert_id) => {
                self.cancel_watchdog();
                self.on_close(alert_id, ts, true).await?;
            }
            None => self.sync_watchdog(&mirror, ts),
        }
        Ok(Some(state))
    }

    /// Closes `alert_id` by hand and announces it like any other close.
    /// `Ok(false)` when the alert was already closed.
    pub async fn reset_alert(self: &Arc<Self>, alert_id: &str, ts: Timestamp) -> Result<bool> {
        let mut mirror = self.state.lock().await;
        if !self.store.reset_alert(&self.rule.id, alert_id, ts).await? {
            return Ok(false);
        }
        let circuit_closed = match self.store.peek_state(&self.rule.id, ts).await? {
            Some(state) => {
                let closed = !state.circuit_state.is_circuit_tripped();
                *mirror = state;
                closed
            }
            None => {
                *mirror = RuleAlertState::default();
                true
            }
        };
        if circuit_closed {
            self.cancel_watchdog();
        }
        self.on_close(alert_id, ts, circuit_closed).await?;
        Ok(true)
    }

    async fn on_open(
        &self,
        resp: &CheckAlertResponse,
        result: &EvaluationResult,
        ts: Timestamp,
    ) -> Result<()> {
        let Some(alert_id) = resp.alert_id.clone() else {
            return Ok(());
        };

        let base = message::base_context(&self.rule, &self.host_id);
        let ctx = message::merge(base.clone(), message::evaluation_context(result)?);
        let data = AlertData {
            alert_id: alert_id.clone(),
            value: result.value,
            failures: resp.failures,
            title: message::render_title(&self.rule, result.error_level),
            message: message::render_message(&self.rule, result, &ctx),
            state: result.state.clone(),
            error_level: result.error_level,
            severity: self.rule.severity,
        };
        let alert = self
            .store
            .write_alert(&self.host_id, &self.rule.id, data, ts)
            .await?;
        tracing::info!(
            rule_id = %self.rule.id,
            alert_id = %alert.id,
            value = alert.value,
            level = %alert.error_level,
            "alert opened"
        );

        let state = match alert.error_level {
            ErrorLevel::Critical => RuleState::Error,
            _ => RuleState::Warning,
        };
        self.bus.publish(RuleEvent::AlertTriggered(Box::new(alert.clone())));
        self.bus.publish(RuleEvent::RuleStateChanged {
            rule_id: self.rule.id.clone(),
            state,
        });

        if resp.notify {
            let decision = self.store.mark_notify(&self.rule.id, &alert_id, ts).await?;
            if decision.accepted {
                let mut ctx = message::merge(base, message::alert_context(&alert)?);
                ctx.insert("alert_count".into(), json!(decision.alert_count));
                self.notify(NotificationEvent::AlertTriggered, &ctx).await;
            }
        }
        Ok(())
    }

    async fn on_repeat(
        &self,
        resp: &CheckAlertResponse,
        result: &EvaluationResult,
        ts: Timestamp,
    ) -> Result<()> {
        let Some(alert_id) = resp.alert_id.as_deref() else {
            return Ok(());
        };
        let decision = self.store.mark_notify(&self.rule.id, alert_id, ts).await?;
        if !decision.accepted {
            tracing::debug!(
                rule_id = %self.rule.id,
                alert_id = %alert_id,
                alert_count = decision.alert_count,
                "repeat notification throttled"
            );
            return Ok(());
        }

        let mut ctx = message::base_context(&self.rule, &self.host_id);
        if let Some(alert) = self.store.get_alert(&self.rule.id, alert_id).await? {
            ctx = message::merge(ctx, message::alert_context(&alert)?);
        }
        ctx = message::merge(ctx, message::evaluation_context(result)?);
        ctx.insert("alert_id".into(), json!(alert_id));
        ctx.insert("alert_count".into(), json!(decision.alert_count));
        self.notify(NotificationEvent::AlertRepeated, &ctx).await;
        Ok(())
    }

    /// `circuit_closed` is false when a manual reset closed an alert other
    /// than the current incident.
    async fn on_close(&self, alert_id: &str, ts: Timestamp, circuit_closed: bool) -> Result<()> {
        tracing::info!(rule_id = %self.rule.id, alert_id = %alert_id, "alert closed");
        self.bus.publish(RuleEvent::AlertReset {
            rule_id: self.rule.id.clone(),
            alert_id: alert_id.to_string(),
            reset_at: ts,
        });
        if circuit_closed {
            self.bus.publish(RuleEvent::RuleStateChanged {
                rule_id: self.rule.id.clone(),
                state: RuleState::Normal,
            });
        }

        if !self.leader.is_held() || !self.rule.alert_options.alert_on_reset {
            return Ok(());
        }
        let mut ctx = message::base_context(&self.rule, &self.host_id);
        if let Some(alert) = self.store.get_alert(&self.rule.id, alert_id).await? {
            ctx = message::merge(ctx, message::alert_context(&alert)?);
        }
        ctx.insert("alert_id".into(), json!(alert_id));
        ctx.insert("reset_at".into(), json!(ts));
        self.notify(NotificationEvent::AlertReset, &ctx).await;
        Ok(())
    }

    async fn notify(&self, event: NotificationEvent, ctx: &TemplateContext) {
        if self.rule.channels.is_empty() {
            return;
        }
        let summary = self.dispatcher.dispatch(event, ctx, &self.rule.channels).await;
        if summary.failed > 0 || summary.unknown > 0 {
            tracing::warn!(
                rule_id = %self.rule.id,
                event = %event,
                delivered = summary.delivered,
                failed = summary.failed,
                unknown = summary.unknown,
                "notification partially delivered"
            );
        }
    }

    fn watchdog(&self) -> MutexGuard<'_, Watchdog> {
        self.watchdog.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn cancel_watchdog(&self) {
        let mut slot = self.watchdog();
        slot.generation += 1;
        slot.end = None;
        if let Some(handle) = slot.handle.take() {
            handle.abort();
        }
    }

    /// Arms the watchdog for the mirror's recovery deadline, or disarms it
    /// when there is none.
    fn sync_watchdog(self: &Arc<Self>, mirror: &RuleAlertState, now: Timestamp) {
        match mirror.end_delay_ts {
            Some(end) if mirror.circuit_state.is_circuit_tripped() => self.schedule_watchdog(end, now),
            _ => self.cancel_watchdog(),
        }
    }

    /// Wakes just after `end` (measured from the evaluation time `now`) to
    /// close a circuit that received no further failures.
    fn schedule_watchdog(self: &Arc<Self>, end: Timestamp, now: Timestamp) {
        if self.is_destroyed() {
            return;
        }
        let mut slot = self.watchdog();
        if slot.end == Some(end) && slot.handle.is_some() {
            return;
        }
        if let Some(handle) = slot.handle.take() {
            handle.abort();
        }
        slot.generation += 1;
        slot.end = Some(end);
        let generation = slot.generation;
        let delay = (end - now + 1).max(0) as u64;
        let weak = Arc::downgrade(self);
        slot.handle = Some(tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(delay)).await;
            if let Some(alerter) = weak.upgrade() {
                alerter.fire_watchdog(generation, end).await;
            }
        }));
    }

    async fn fire_watchdog(self: Arc<Self>, generation: u64, end: Timestamp) {
        {
            let mut slot = self.watchdog();
            if slot.generation != generation {
                return;
            }
            slot.end = None;
            slot.handle = None;
        }
        if self.is_destroyed() || !self.leader.is_held() {
            return;
        }
        if let Err(e) = self.check_state(end + 1).await {
            tracing::warn!(rule_id = %self.rule.id, error = %e, "watchdog state check failed");
        }
    }
}

impl Drop for RuleAlerter {
    fn drop(&mut self) {
        if let Some(handle) = self.watchdog().handle.take() {
            handle.abort();
        }
    }
}
