use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use qwatch_alert::alerter::record::{apply_record, merge_saved_rule, RuleStateRecord};
use qwatch_alert::alerter::store::{host_counter_key, queue_counter_key};
use qwatch_alert::alerter::{
    AlertData, AlertQuery, AlertStatus, AlertStore, CheckAlertResponse, CheckStatus,
    NotifyDecision, RuleAlert, RuleAlertState, RuleStatusChange,
};
use qwatch_alert::conditions::ErrorLevel;
use qwatch_alert::rule::{Rule, RuleState};
use qwatch_common::types::Timestamp;
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};

use crate::error::{Result, StorageError};

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS rules (
    id TEXT PRIMARY KEY,
    host_id TEXT NOT NULL,
    config_json TEXT NOT NULL,
    created_at INTEGER NOT NULL,
    updated_at INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_rules_host ON rules(host_id);

CREATE TABLE IF NOT EXISTS rule_states (
    rule_id TEXT PRIMARY KEY,
    state_json TEXT NOT NULL,
    updated_at INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS alerts (
    id TEXT PRIMARY KEY,
    rule_id TEXT NOT NULL,
    host_id TEXT NOT NULL,
    status TEXT NOT NULL,
    raised_at INTEGER NOT NULL,
    reset_at INTEGER,
    alert_json TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_alerts_rule_raised ON alerts(rule_id, raised_at);
CREATE INDEX IF NOT EXISTS idx_alerts_status_raised ON alerts(status, raised_at);

CREATE TABLE IF NOT EXISTS alert_counters (
    key TEXT PRIMARY KEY,
    count INTEGER NOT NULL
);
";

fn rule_not_found(id: &str) -> StorageError {
    StorageError::NotFound {
        entity: "rule",
        id: id.to_string(),
    }
}

fn load_rule(conn: &Connection, rule_id: &str) -> Result<Option<(String, Rule)>> {
    let row = conn
        .query_row(
            "SELECT host_id, config_json FROM rules WHERE id = ?1",
            params![rule_id],
            |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)),
        )
        .optional()?;
    match row {
        Some((host, json)) => Ok(Some((host, serde_json::from_str(&json)?))),
        None => Ok(None),
    }
}

fn store_rule(conn: &Connection, host_id: &str, rule: &Rule) -> Result<()> {
    conn.execute(
        "INSERT INTO rules (id, host_id, config_json, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5)
         ON CONFLICT(id) DO UPDATE SET
             host_id = excluded.host_id,
             config_json = excluded.config_json,
             updated_at = excluded.updated_at",
        params![
            rule.id,
            host_id,
            serde_json::to_string(rule)?,
            rule.created_at,
            rule.updated_at
        ],
    )?;
    Ok(())
}

/// Rewrites the summary fields of a stored rule.
fn update_rule<F>(conn: &Connection, rule_id: &str, f: F) -> Result<()>
where
    F: FnOnce(&mut Rule),
{
    if let Some((host, mut rule)) = load_rule(conn, rule_id)? {
        f(&mut rule);
        store_rule(conn, &host, &rule)?;
    }
    Ok(())
}

fn load_state(conn: &Connection, rule_id: &str) -> Result<Option<RuleStateRecord>> {
    let json: Option<String> = conn
        .query_row(
            "SELECT state_json FROM rule_states WHERE rule_id = ?1",
            params![rule_id],
            |row| row.get(0),
        )
        .optional()?;
    Ok(json.map(|j| serde_json::from_str(&j)).transpose()?)
}

fn store_state(conn: &Connection, rule_id: &str, record: &RuleStateRecord, ts: Timestamp) -> Result<()> {
    conn.execute(
        "INSERT INTO rule_states (rule_id, state_json, updated_at) VALUES (?1, ?2, ?3)
         ON CONFLICT(rule_id) DO UPDATE SET
             state_json = excluded.state_json,
             updated_at = excluded.updated_at",
        params![rule_id, serde_json::to_string(record)?, ts],
    )?;
    Ok(())
}

fn load_alert(conn: &Connection, rule_id: &str, alert_id: &str) -> Result<Option<RuleAlert>> {
    let json: Option<String> = conn
        .query_row(
            "SELECT alert_json FROM alerts WHERE id = ?1 AND rule_id = ?2",
            params![alert_id, rule_id],
            |row| row.get(0),
        )
        .optional()?;
    Ok(json.map(|j| serde_json::from_str(&j)).transpose()?)
}

fn store_alert(conn: &Connection, alert: &RuleAlert) -> Result<()> {
    conn.execute(
        "INSERT OR REPLACE INTO alerts (id, rule_id, host_id, status, raised_at, reset_at, alert_json)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            alert.id,
            alert.rule_id,
            alert.host_id,
            alert.status.as_str(),
            alert.raised_at,
            alert.reset_at,
            serde_json::to_string(alert)?
        ],
    )?;
    Ok(())
}

/// Marks an open alert closed. Returns false when it is missing or already
/// closed.
fn close_alert(conn: &Connection, rule_id: &str, alert_id: &str, ts: Timestamp) -> Result<bool> {
    match load_alert(conn, rule_id, alert_id)? {
        Some(mut alert) if alert.is_open() => {
            alert.status = AlertStatus::Close;
            alert.reset_at = Some(ts);
            store_alert(conn, &alert)?;
            Ok(true)
        }
        _ => Ok(false),
    }
}

fn incr_counter(conn: &Connection, key: &str) -> Result<()> {
    conn.execute(
        "INSERT INTO alert_counters (key, count) VALUES (?1, 1)
         ON CONFLICT(key) DO UPDATE SET count = count + 1",
        params![key],
    )?;
    Ok(())
}

fn read_counter(conn: &Connection, key: &str) -> Result<u64> {
    let count: Option<i64> = conn
        .query_row(
            "SELECT count FROM alert_counters WHERE key = ?1",
            params![key],
            |row| row.get(0),
        )
        .optional()?;
    Ok(count.unwrap_or(0).max(0) as u64)
}

/// [`AlertStore`] on one SQLite file.
///
/// Calls run on tokio's blocking pool. Mutations take the database write
/// lock up front (`BEGIN IMMEDIATE`) and wait up to five seconds for it, so
/// concurrent processes serialize on the file rather than fail.
pub struct SqliteAlertStore {
    conn: Arc<Mutex<Connection>>,
    path: PathBuf,
}

impl SqliteAlertStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(&path)?;
        conn.busy_timeout(BUSY_TIMEOUT)?;
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;
        conn.execute_batch(SCHEMA)?;
        tracing::info!(path = %path.display(), "alert store opened");
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            path,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn run<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
    {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let mut guard = conn.lock().unwrap_or_else(|p| p.into_inner());
            f(&mut guard)
        })
        .await?
    }

    /// Runs `f` in a `BEGIN IMMEDIATE` transaction, committing on success.
    async fn write<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> Result<T> + Send + 'static,
    {
        self.run(move |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let out = f(&tx)?;
            tx.commit()?;
            Ok(out)
        })
        .await
    }
}

#[async_trait]
impl AlertStore for SqliteAlertStore {
    async fn check_alert(
        &self,
        rule_id: &str,
        level: ErrorLevel,
        ts: Timestamp,
    ) -> qwatch_alert::Result<CheckAlertResponse> {
        let rule_id = rule_id.to_string();
        let resp = self
            .write(move |conn| {
                let Some(mut record) = load_state(conn, &rule_id)? else {
                    return Ok(CheckAlertResponse::not_found());
                };
                let resp = record.check(level, ts, qwatch_common::id::next_id);
                store_state(conn, &rule_id, &record, ts)?;
                if resp.status == CheckStatus::Close {
                    if let Some(alert_id) = resp.alert_id.as_deref() {
                        close_alert(conn, &rule_id, alert_id, ts)?;
                    }
                    update_rule(conn, &rule_id, |rule| rule.state = RuleState::Normal)?;
                }
                Ok(resp)
            })
            .await?;
        Ok(resp)
    }

    async fn get_state(
        &self,
        rule_id: &str,
        ts: Timestamp,
    ) -> qwatch_alert::Result<Option<RuleAlertState>> {
        let rule_id = rule_id.to_string();
        let state = self
            .write(move |conn| {
                let Some(mut record) = load_state(conn, &rule_id)? else {
                    return Ok(None);
                };
                let state = record.state_at(ts);
                if let Some(alert_id) = state.closed_alert_id.as_deref() {
                    store_state(conn, &rule_id, &record, ts)?;
                    close_alert(conn, &rule_id, alert_id, ts)?;
                    update_rule(conn, &rule_id, |rule| rule.state = RuleState::Normal)?;
                }
                Ok(Some(state))
            })
            .await?;
        Ok(state)
    }

    async fn peek_state(
        &self,
        rule_id: &str,
        ts: Timestamp,
    ) -> qwatch_alert::Result<Option<RuleAlertState>> {
        let rule_id = rule_id.to_string();
        let state = self
            .run(move |conn| Ok(load_state(conn, &rule_id)?.map(|record| record.snapshot(ts))))
            .await?;
        Ok(state)
    }

    async fn write_alert(
        &self,
        host_id: &str,
        rule_id: &str,
        data: AlertData,
        ts: Timestamp,
    ) -> qwatch_alert::Result<RuleAlert> {
        let host_id = host_id.to_string();
        let rule_id = rule_id.to_string();
        let alert = self
            .write(move |conn| {
                if let Some(existing) = load_alert(conn, &rule_id, &data.alert_id)? {
                    return Ok(existing);
                }
                let Some((rule_host, mut rule)) = load_rule(conn, &rule_id)? else {
                    return Err(rule_not_found(&rule_id));
                };
                rule.state = match data.error_level {
                    ErrorLevel::Critical => RuleState::Error,
                    _ => RuleState::Warning,
                };
                rule.last_triggered_at = Some(ts);
                store_rule(conn, &rule_host, &rule)?;

                let alert = RuleAlert::from_data(&host_id, &rule_id, data, ts);
                store_alert(conn, &alert)?;
                if let Some(queue_id) = rule.queue_id.as_deref() {
                    incr_counter(conn, &queue_counter_key(queue_id))?;
                }
                incr_counter(conn, &host_counter_key(&host_id))?;
                Ok(alert)
            })
            .await?;
        Ok(alert)
    }

    async fn reset_alert(
        &self,
        rule_id: &str,
        alert_id: &str,
        ts: Timestamp,
    ) -> qwatch_alert::Result<bool> {
        let rule_id = rule_id.to_string();
        let alert_id = alert_id.to_string();
        let reset = self
            .write(move |conn| {
                match load_alert(conn, &rule_id, &alert_id)? {
                    None => {
                        return Err(StorageError::NotFound {
                            entity: "alert",
                            id: alert_id,
                        })
                    }
                    Some(alert) if !alert.is_open() => return Ok(false),
                    Some(_) => {}
                }
                close_alert(conn, &rule_id, &alert_id, ts)?;
                if let Some(mut record) = load_state(conn, &rule_id)? {
                    if record.close_if_current(&alert_id) {
                        store_state(conn, &rule_id, &record, ts)?;
                        update_rule(conn, &rule_id, |rule| rule.state = RuleState::Normal)?;
                    }
                }
                Ok(true)
            })
            .await?;
        Ok(reset)
    }

    async fn mark_notify(
        &self,
        rule_id: &str,
        alert_id: &str,
        ts: Timestamp,
    ) -> qwatch_alert::Result<NotifyDecision> {
        let rule_id = rule_id.to_string();
        let alert_id = alert_id.to_string();
        let decision = self
            .write(move |conn| {
                let mut record = load_state(conn, &rule_id)?.ok_or_else(|| rule_not_found(&rule_id))?;
                let decision = record.mark_notify(&alert_id, ts);
                if decision.accepted {
                    store_state(conn, &rule_id, &record, ts)?;
                }
                Ok(decision)
            })
            .await?;
        Ok(decision)
    }

    async fn activate_rule(
        &self,
        rule_id: &str,
        ts: Timestamp,
    ) -> qwatch_alert::Result<RuleStatusChange> {
        self.set_active(rule_id, true, ts).await
    }

    async fn deactivate_rule(
        &self,
        rule_id: &str,
        ts: Timestamp,
    ) -> qwatch_alert::Result<RuleStatusChange> {
        self.set_active(rule_id, false, ts).await
    }

    async fn queue_alert_count(&self, queue_id: &str) -> qwatch_alert::Result<u64> {
        let key = queue_counter_key(queue_id);
        Ok(self.run(move |conn| read_counter(conn, &key)).await?)
    }

    async fn host_alert_count(&self, host_id: &str) -> qwatch_alert::Result<u64> {
        let key = host_counter_key(host_id);
        Ok(self.run(move |conn| read_counter(conn, &key)).await?)
    }

    async fn save_rule(
        &self,
        host_id: &str,
        rule: &Rule,
        ts: Timestamp,
    ) -> qwatch_alert::Result<Rule> {
        let host_id = host_id.to_string();
        let rule = rule.clone();
        let saved = self
            .write(move |conn| {
                let existing = load_rule(conn, &rule.id)?.map(|(_, r)| r);
                let mut saved = merge_saved_rule(existing.as_ref(), &rule, ts);
                let record = match load_state(conn, &rule.id)? {
                    Some(mut record) => {
                        record.configure(&saved, ts);
                        record
                    }
                    None => RuleStateRecord::new(&saved, ts),
                };
                store_state(conn, &rule.id, &record, ts)?;
                apply_record(&mut saved, &record);
                store_rule(conn, &host_id, &saved)?;
                Ok(saved)
            })
            .await?;
        Ok(saved)
    }

    async fn get_rule(&self, rule_id: &str) -> qwatch_alert::Result<Option<Rule>> {
        let rule_id = rule_id.to_string();
        let rule = self
            .run(move |conn| {
                let Some((_, mut rule)) = load_rule(conn, &rule_id)? else {
                    return Ok(None);
                };
                if let Some(record) = load_state(conn, &rule_id)? {
                    apply_record(&mut rule, &record);
                }
                Ok(Some(rule))
            })
            .await?;
        Ok(rule)
    }

    async fn list_rules(&self, host_id: &str) -> qwatch_alert::Result<Vec<Rule>> {
        let host_id = host_id.to_string();
        let rules = self
            .run(move |conn| {
                let mut stmt = conn.prepare_cached(
                    "SELECT r.config_json, s.state_json FROM rules r
                     LEFT JOIN rule_states s ON s.rule_id = r.id
                     WHERE r.host_id = ?1 ORDER BY r.id",
                )?;
                let rows = stmt.query_map(params![host_id], |row| {
                    Ok((row.get::<_, String>(0)?, row.get::<_, Option<String>>(1)?))
                })?;
                let mut rules = Vec::new();
                for row in rows {
                    let (config, state) = row?;
                    let mut rule: Rule = serde_json::from_str(&config)?;
                    if let Some(state) = state {
                        let record: RuleStateRecord = serde_json::from_str(&state)?;
                        apply_record(&mut rule, &record);
                    }
                    rules.push(rule);
                }
                Ok(rules)
            })
            .await?;
        Ok(rules)
    }

    async fn delete_rule(&self, rule_id: &str) -> qwatch_alert::Result<bool> {
        let rule_id = rule_id.to_string();
        let deleted = self
            .write(move |conn| {
                let removed = conn.execute("DELETE FROM rules WHERE id = ?1", params![rule_id])?;
                conn.execute("DELETE FROM rule_states WHERE rule_id = ?1", params![rule_id])?;
                conn.execute("DELETE FROM alerts WHERE rule_id = ?1", params![rule_id])?;
                Ok(removed > 0)
            })
            .await?;
        Ok(deleted)
    }

    async fn get_alerts(
        &self,
        rule_id: &str,
        query: &AlertQuery,
    ) -> qwatch_alert::Result<Vec<RuleAlert>> {
        let rule_id = rule_id.to_string();
        let query = query.clone();
        let alerts = self
            .run(move |conn| {
                let mut stmt = conn.prepare_cached(
                    "SELECT alert_json FROM alerts
                     WHERE rule_id = ?1
                       AND (?2 IS NULL OR raised_at >= ?2)
                       AND (?3 IS NULL OR raised_at < ?3)
                       AND (?4 IS NULL OR status = ?4)
                     ORDER BY raised_at DESC, id DESC
                     LIMIT ?5 OFFSET ?6",
                )?;
                let limit = query.limit.map(|l| l as i64).unwrap_or(-1);
                let rows = stmt.query_map(
                    params![
                        rule_id,
                        query.since,
                        query.until,
                        query.status.map(|s| s.as_str()),
                        limit,
                        query.offset as i64
                    ],
                    |row| row.get::<_, String>(0),
                )?;
                let mut alerts = Vec::new();
                for row in rows {
                    alerts.push(serde_json::from_str(&row?)?);
                }
                Ok(alerts)
            })
            .await?;
        Ok(alerts)
    }

    async fn get_alert(
        &self,
        rule_id: &str,
        alert_id: &str,
    ) -> qwatch_alert::Result<Option<RuleAlert>> {
        let rule_id = rule_id.to_string();
        let alert_id = alert_id.to_string();
        Ok(self
            .run(move |conn| load_alert(conn, &rule_id, &alert_id))
            .await?)
    }

    async fn delete_alert(&self, rule_id: &str, alert_id: &str) -> qwatch_alert::Result<bool> {
        let rule_id = rule_id.to_string();
        let alert_id = alert_id.to_string();
        let deleted = self
            .write(move |conn| {
                let n = conn.execute(
                    "DELETE FROM alerts WHERE id = ?1 AND rule_id = ?2",
                    params![alert_id, rule_id],
                )?;
                Ok(n > 0)
            })
            .await?;
        Ok(deleted)
    }

    async fn mark_alert_read(&self, rule_id: &str, alert_id: &str) -> qwatch_alert::Result<bool> {
        let rule_id = rule_id.to_string();
        let alert_id = alert_id.to_string();
        let marked = self
            .write(move |conn| match load_alert(conn, &rule_id, &alert_id)? {
                Some(mut alert) => {
                    alert.is_read = true;
                    store_alert(conn, &alert)?;
                    Ok(true)
                }
                None => Ok(false),
            })
            .await?;
        Ok(marked)
    }

    async fn prune_alerts(&self, before: Timestamp) -> qwatch_alert::Result<u64> {
        let pruned = self
            .write(move |conn| {
                let n = conn.execute(
                    "DELETE FROM alerts WHERE status = ?1 AND raised_at < ?2",
                    params![AlertStatus::Close.as_str(), before],
                )?;
                Ok(n as u64)
            })
            .await?;
        Ok(pruned)
    }
}

impl SqliteAlertStore {
    async fn set_active(
        &self,
        rule_id: &str,
        active: bool,
        ts: Timestamp,
    ) -> qwatch_alert::Result<RuleStatusChange> {
        let rule_id = rule_id.to_string();
        let change = self
            .write(move |conn| {
                let Some(mut record) = load_state(conn, &rule_id)? else {
                    return Ok(RuleStatusChange::NotFound);
                };
                let change = if active {
                    record.activate(ts)
                } else {
                    record.deactivate()
                };
                if change != RuleStatusChange::Unchanged {
                    store_state(conn, &rule_id, &record, ts)?;
                    let state = record.summary_state();
                    update_rule(conn, &rule_id, |rule| {
                        rule.is_active = active;
                        rule.state = state;
                    })?;
                }
                Ok(change)
            })
            .await?;
        Ok(change)
    }
}
