use crate::core::db;
use crate::core::error;
use crate::core::time;
use rusqlite::{Connection, TransactionBehavior};
use serde::{Deserialize, Serialize};
use std::fs::OpenOptions;
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

/// The DB Broker is the single entry point for state mutation.
///
/// Every external call runs inside one brokered transaction: calls are
/// serialized in-process, committed on success and rolled back on any error.
pub struct DbBroker {
    audit_log_path: PathBuf,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct BrokerEvent {
    pub ts: String,
    pub event_id: String,
    pub actor: String,
    pub op: String,
    pub db_id: String,
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_code: Option<String>,
}

/// Domain notification emitted by a module or the registry during a call.
///
/// Recorded in the audit trail only when the call commits.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Notification {
    pub name: String,
    pub data: serde_json::Value,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct NotificationEvent {
    pub ts: String,
    pub event_id: String,
    pub instance: String,
    pub name: String,
    pub data: serde_json::Value,
}

/// One line of the audit trail.
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AuditEntry {
    Call(BrokerEvent),
    Notification(NotificationEvent),
}

static DB_LOCK: Mutex<()> = Mutex::new(());

impl DbBroker {
    pub fn new(audit_log_path: &Path) -> Self {
        Self {
            audit_log_path: audit_log_path.to_path_buf(),
        }
    }

    /// Execute a closure inside a serialized, all-or-nothing transaction on `db_path`.
    pub fn with_tx<F, R>(
        &self,
        db_path: &Path,
        actor: &str,
        op_name: &str,
        f: F,
    ) -> Result<R, error::CharterError>
    where
        F: FnOnce(&Connection) -> Result<R, error::CharterError>,
    {
        self.with_tx_publishing(db_path, actor, op_name, "", |conn| {
            f(conn).map(|value| (value, Vec::new()))
        })
        .map(|(value, _)| value)
    }

    /// Like [`DbBroker::with_tx`], additionally recording the notifications the
    /// closure returns for `instance`.
    ///
    /// The audit lines for a successful call are written before the commit. If
    /// they cannot be written the transaction rolls back and the call fails, so
    /// a committed change is always audited and an unaudited one never lands.
    pub fn with_tx_publishing<F, R>(
        &self,
        db_path: &Path,
        actor: &str,
        op_name: &str,
        instance: &str,
        f: F,
    ) -> Result<(R, Vec<Notification>), error::CharterError>
    where
        F: FnOnce(&Connection) -> Result<(R, Vec<Notification>), error::CharterError>,
    {
        let _lock = DB_LOCK.lock().unwrap_or_else(|poisoned| poisoned.into_inner());

        let db_id = db_path
            .file_name()
            .unwrap_or_default()
            .to_string_lossy()
            .to_string();
        let call_event = |code: Option<&str>| {
            AuditEntry::Call(BrokerEvent {
                ts: time::now_epoch_z(),
                event_id: time::new_event_id(),
                actor: actor.to_string(),
                op: op_name.to_string(),
                db_id: db_id.clone(),
                status: if code.is_some() { "error" } else { "success" }.to_string(),
                error_code: code.map(str::to_string),
            })
        };

        let mut conn = db::db_connect(db_path)?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let (value, notifications) = match f(&tx) {
            Ok(outcome) => outcome,
            Err(e) => {
                // Report the call's own error even if rollback or audit fails.
                let _ = tx.rollback();
                let _ = self.append_all(&[call_event(Some(e.code()))]);
                return Err(e);
            }
        };

        let mut entries = vec![call_event(None)];
        entries.extend(notifications.iter().map(|n| {
            AuditEntry::Notification(NotificationEvent {
                ts: time::now_epoch_z(),
                event_id: time::new_event_id(),
                instance: instance.to_string(),
                name: n.name.clone(),
                data: n.data.clone(),
            })
        }));
        if let Err(e) = self.append_all(&entries) {
            let _ = tx.rollback();
            return Err(e);
        }
        if let Err(e) = tx.commit() {
            let e = error::CharterError::from(e);
            let _ = self.append_all(&[call_event(Some(e.code()))]);
            return Err(e);
        }
        Ok((value, notifications))
    }

    /// Append entries as one write so a call's lines land together.
    fn append_all(&self, entries: &[AuditEntry]) -> Result<(), error::CharterError> {
        let mut buf = String::new();
        for entry in entries {
            buf.push_str(&serde_json::to_string(entry)?);
            buf.push('\n');
        }
        let mut f = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.audit_log_path)
            .map_err(error::CharterError::IoError)?;
        f.write_all(buf.as_bytes()).map_err(error::CharterError::IoError)?;
        Ok(())
    }

    /// Read the full audit trail in append order. A missing log is empty.
    pub fn read_audit_log(&self) -> Result<Vec<AuditEntry>, error::CharterError> {
        if !self.audit_log_path.exists() {
            return Ok(Vec::new());
        }
        let file = std::fs::File::open(&self.audit_log_path).map_err(error::CharterError::IoError)?;
        let mut out = Vec::new();
        for line in BufReader::new(file).lines() {
            let line = line.map_err(error::CharterError::IoError)?;
            if line.trim().is_empty() {
                continue;
            }
            out.push(serde_json::from_str(&line)?);
        }
        Ok(out)
    }
}
