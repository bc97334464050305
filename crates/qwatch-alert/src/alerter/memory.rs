use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use qwatch_common::types::Timestamp;

use super::record::{apply_record, merge_saved_rule, RuleStateRecord};
use super::store::{host_counter_key, queue_counter_key, AlertStore};
use super::types::{
    AlertData, AlertQuery, AlertStatus, CheckAlertResponse, CheckStatus, NotifyDecision,
    RuleAlert, RuleAlertState, RuleStatusChange,
};
use crate::conditions::ErrorLevel;
use crate::error::{AlertError, Result};
use crate::rule::{Rule, RuleState};

#[derive(Default)]
struct Inner {
    rules: HashMap<String, (String, Rule)>,
    states: HashMap<String, RuleStateRecord>,
    alerts: HashMap<String, RuleAlert>,
    counters: HashMap<String, u64>,
}

impl Inner {
    fn close_alert(&mut self, rule_id: &str, alert_id: &str, ts: Timestamp) -> bool {
        let Some(alert) = self.alerts.get_mut(alert_id) else {
            return false;
        };
        if alert.rule_id != rule_id || !alert.is_open() {
            return false;
        }
        alert.status = AlertStatus::Close;
        alert.reset_at = Some(ts);
        true
    }

    fn set_rule_state(&mut self, rule_id: &str, state: RuleState) {
        if let Some((_, rule)) = self.rules.get_mut(rule_id) {
            rule.state = state;
        }
    }

    fn alert_of(&self, rule_id: &str, alert_id: &str) -> Option<&RuleAlert> {
        self.alerts.get(alert_id).filter(|a| a.rule_id == rule_id)
    }
}

/// Single-process [`AlertStore`]. One mutex guards all state, so every
/// operation is trivially atomic.
#[derive(Default)]
pub struct MemoryAlertStore {
    inner: Mutex<Inner>,
}

impl MemoryAlertStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|p| p.into_inner())
    }
}

#[async_trait]
impl AlertStore for MemoryAlertStore {
    async fn check_alert(
        &self,
        rule_id: &str,
        level: ErrorLevel,
        ts: Timestamp,
    ) -> Result<CheckAlertResponse> {
        let mut inner = self.lock();
        let Some(record) = inner.states.get_mut(rule_id) else {
            return Ok(CheckAlertResponse::not_found());
        };
        let resp = record.check(level, ts, qwatch_common::id::next_id);
        if resp.status == CheckStatus::Close {
            if let Some(alert_id) = resp.alert_id.as_deref() {
                inner.close_alert(rule_id, alert_id, ts);
            }
            inner.set_rule_state(rule_id, RuleState::Normal);
        }
        Ok(resp)
    }

    async fn get_state(&self, rule_id: &str, ts: Timestamp) -> Result<Option<RuleAlertState>> {
        let mut inner = self.lock();
        let Some(record) = inner.states.get_mut(rule_id) else {
            return Ok(None);
        };
        let state = record.state_at(ts);
        if let Some(alert_id) = state.closed_alert_id.as_deref() {
            inner.close_alert(rule_id, alert_id, ts);
            inner.set_rule_state(rule_id, RuleState::Normal);
        }
        Ok(Some(state))
    }

    async fn peek_state(&self, rule_id: &str, ts: Timestamp) -> Result<Option<RuleAlertState>> {
        Ok(self.lock().states.get(rule_id).map(|record| record.snapshot(ts)))
    }

    async fn write_alert(
        &self,
        host_id: &str,
        rule_id: &str,
        data: AlertData,
        ts: Timestamp,
    ) -> Result<RuleAlert> {
        let mut inner = self.lock();
        if let Some(existing) = inner.alerts.get(&data.alert_id) {
            return Ok(existing.clone());
        }
        let Some((_, rule)) = inner.rules.get_mut(rule_id) else {
            return Err(AlertError::RuleNotFound(rule_id.to_string()));
        };
        rule.state = match data.error_level {
            ErrorLevel::Critical => RuleState::Error,
            _ => RuleState::Warning,
        };
        rule.last_triggered_at = Some(ts);
        let queue_key = rule.queue_id.as_deref().map(queue_counter_key);

        let alert = RuleAlert::from_data(host_id, rule_id, data, ts);
        inner.alerts.insert(alert.id.clone(), alert.clone());
        if let Some(key) = queue_key {
            *inner.counters.entry(key).or_default() += 1;
        }
        *inner.counters.entry(host_counter_key(host_id)).or_default() += 1;
        Ok(alert)
    }

    async fn reset_alert(&self, rule_id: &str, alert_id: &str, ts: Timestamp) -> Result<bool> {
        let mut inner = self.lock();
        match inner.alert_of(rule_id, alert_id) {
            None => return Err(AlertError::AlertNotFound(alert_id.to_string())),
            Some(alert) if !alert.is_open() => return Ok(false),
            Some(_) => {}
        }
        inner.close_alert(rule_id, alert_id, ts);
        let closed_circuit = inner
            .states
            .get_mut(rule_id)
            .is_some_and(|record| record.close_if_current(alert_id));
        if closed_circuit {
            inner.set_rule_state(rule_id, RuleState::Normal);
        }
        Ok(true)
    }

    async fn mark_notify(
        &self,
        rule_id: &str,
        alert_id: &str,
        ts: Timestamp,
    ) -> Result<NotifyDecision> {
        let mut inner = self.lock();
        let record = inner
            .states
            .get_mut(rule_id)
            .ok_or_else(|| AlertError::RuleNotFound(rule_id.to_string()))?;
        Ok(record.mark_notify(alert_id, ts))
    }

    async fn activate_rule(&self, rule_id: &str, ts: Timestamp) -> Result<RuleStatusChange> {
        let mut inner = self.lock();
        let Some(record) = inner.states.get_mut(rule_id) else {
            return Ok(RuleStatusChange::NotFound);
        };
        let change = record.activate(ts);
        let state = record.summary_state();
        if let Some((_, rule)) = inner.rules.get_mut(rule_id) {
            rule.is_active = true;
            rule.state = state;
        }
        Ok(change)
    }

    async fn deactivate_rule(&self, rule_id: &str, _ts: Timestamp) -> Result<RuleStatusChange> {
        let mut inner = self.lock();
        let Some(record) = inner.states.get_mut(rule_id) else {
            return Ok(RuleStatusChange::NotFound);
        };
        let change = record.deactivate();
        if let Some((_, rule)) = inner.rules.get_mut(rule_id) {
            rule.is_active = false;
            rule.state = RuleState::Muted;
        }
        Ok(change)
    }

    async fn queue_alert_count(&self, queue_id: &str) -> Result<u64> {
        let inner = self.lock();
        Ok(inner
            .counters
            .get(&queue_counter_key(queue_id))
            .copied()
            .unwrap_or(0))
    }

    async fn host_alert_count(&self, host_id: &str) -> Result<u64> {
        let inner = self.lock();
        Ok(inner
            .counters
            .get(&host_counter_key(host_id))
            .copied()
            .unwrap_or(0))
    }

    async fn save_rule(&self, host_id: &str, rule: &Rule, ts: Timestamp) -> Result<Rule> {
        let mut inner = self.lock();
        let existing = inner.rules.get(&rule.id).map(|(_, r)| r);
        let mut saved = merge_saved_rule(existing, rule, ts);
        let record = inner
            .states
            .entry(rule.id.clone())
            .and_modify(|record| {
                record.configure(&saved, ts);
            })
            .or_insert_with(|| RuleStateRecord::new(&saved, ts));
        apply_record(&mut saved, record);
        inner
            .rules
            .insert(rule.id.clone(), (host_id.to_string(), saved.clone()));
        Ok(saved)
    }

    async fn get_rule(&self, rule_id: &str) -> Result<Option<Rule>> {
        let inner = self.lock();
        Ok(inner.rules.get(rule_id).map(|(_, rule)| {
            let mut rule = rule.clone();
            if let Some(record) = inner.states.get(rule_id) {
                apply_record(&mut rule, record);
            }
            rule
        }))
    }

    async fn list_rules(&self, host_id: &str) -> Result<Vec<Rule>> {
        let inner = self.lock();
        let mut rules: Vec<Rule> = inner
            .rules
            .values()
            .filter(|(host, _)| host == host_id)
            .map(|(_, rule)| {
                let mut rule = rule.clone();
                if let Some(record) = inner.states.get(&rule.id) {
                    apply_record(&mut rule, record);
                }
                rule
            })
            .collect();
        rules.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(rules)
    }

    async fn delete_rule(&self, rule_id: &str) -> Result<bool> {
        let mut inner = self.lock();
        let existed = inner.rules.remove(rule_id).is_some();
        inner.states.remove(rule_id);
        inner.alerts.retain(|_, alert| alert.rule_id != rule_id);
        Ok(existed)
    }

    async fn get_alerts(&self, rule_id: &str, query: &AlertQuery) -> Result<Vec<RuleAlert>> {
        let inner = self.lock();
        Ok(query.apply(
            inner
                .alerts
                .values()
                .filter(|a| a.rule_id == rule_id)
                .cloned(),
        ))
    }

    async fn get_alert(&self, rule_id: &str, alert_id: &str) -> Result<Option<RuleAlert>> {
        Ok(self.lock().alert_of(rule_id, alert_id).cloned())
    }

    async fn delete_alert(&self, rule_id: &str, alert_id: &str) -> Result<bool> {
        let mut inner = self.lock();
        if inner.alert_of(rule_id, alert_id).is_none() {
            return Ok(false);
        }
        Ok(inner.alerts.remove(alert_id).is_some())
    }

    async fn mark_alert_read(&self, rule_id: &str, alert_id: &str) -> Result<bool> {
        let mut inner = self.lock();
        match inner.alerts.get_mut(alert_id) {
            Some(alert) if alert.rule_id == rule_id => {
                alert.is_read = true;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn prune_alerts(&self, before: Timestamp) -> Result<u64> {
        let mut inner = self.lock();
        let len = inner.alerts.len();
        inner
            .alerts
            .retain(|_, alert| alert.is_open() || alert.raised_at >= before);
        Ok((len - inner.alerts.len()) as u64)
    }
}
