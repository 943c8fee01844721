//! Instance registry (factory).
//!
//! The registry is an explicit object over `registry.db`; callers construct it
//! from a `Store` and pass it by reference. Creating an instance allocates its
//! storage, runs the kernel's one-time initializer and records metadata as a
//! single unit: on any failure neither the instance file nor the registry row
//! survives.

use crate::core::address::Address;
use crate::core::broker::{DbBroker, Notification};
use crate::core::config::CharterConfig;
use crate::core::db;
use crate::core::error::{CharterError, Reason};
use crate::core::kernel::{Instance, ModuleCatalog};
use crate::core::store::Store;
use crate::core::time;
use rusqlite::{Connection, OptionalExtension, Row, params};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::fmt;
use std::str::FromStr;
use ulid::Ulid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Visibility {
    #[default]
    Public,
    Private,
}

impl Visibility {
    pub fn as_str(self) -> &'static str {
        match self {
            Visibility::Public => "public",
            Visibility::Private => "private",
        }
    }
}

impl fmt::Display for Visibility {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Visibility {
    type Err = CharterError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "public" => Ok(Visibility::Public),
            "private" => Ok(Visibility::Private),
            other => Err(CharterError::ValidationError(Reason::MalformedPayload(format!(
                "unknown visibility {}",
                other
            )))),
        }
    }
}

/// Everything needed to create one instance.
#[derive(Debug, Clone)]
pub struct CreateInstance {
    pub name: String,
    pub description: String,
    /// `None` falls back to the configured default visibility.
    pub visibility: Option<Visibility>,
    /// Caller-supplied grouping label (for example a template name).
    pub label: String,
    pub creator: Address,
    pub modules: Vec<String>,
    pub init_payloads: Vec<Value>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceRecord {
    pub index: u64,
    pub id: String,
    pub name: String,
    pub description: String,
    pub visibility: Visibility,
    pub label: String,
    pub creator: Address,
    pub modules: Vec<String>,
    pub created_at: String,
}

#[derive(Debug, Clone, Default)]
pub struct InstanceFilter {
    pub visibility: Option<Visibility>,
    pub creator: Option<Address>,
    pub label: Option<String>,
}

impl InstanceFilter {
    fn matches(&self, record: &InstanceRecord) -> bool {
        self.visibility.is_none_or(|v| v == record.visibility)
            && self.creator.as_ref().is_none_or(|c| *c == record.creator)
            && self.label.as_ref().is_none_or(|l| *l == record.label)
    }
}

pub struct Registry<'s> {
    store: &'s Store,
    broker: DbBroker,
}

const SELECT_RECORD: &str = "SELECT idx, id, name, description, visibility, label, creator, modules, created_at FROM instances";

fn record_from_row(row: &Row<'_>) -> rusqlite::Result<(i64, [String; 8])> {
    Ok((
        row.get(0)?,
        [
            row.get(1)?,
            row.get(2)?,
            row.get(3)?,
            row.get(4)?,
            row.get(5)?,
            row.get(6)?,
            row.get(7)?,
            row.get(8)?,
        ],
    ))
}

fn decode_record((idx, cols): (i64, [String; 8])) -> Result<InstanceRecord, CharterError> {
    let [id, name, description, visibility, label, creator, modules, created_at] = cols;
    Ok(InstanceRecord {
        index: (idx - 1).max(0) as u64,
        id,
        name,
        description,
        visibility: visibility.parse()?,
        label,
        creator: Address::new(creator)?,
        modules: serde_json::from_str(&modules)?,
        created_at,
    })
}

fn query_records(
    conn: &Connection,
    sql: &str,
    args: impl rusqlite::Params,
) -> Result<Vec<InstanceRecord>, CharterError> {
    let mut stmt = conn.prepare(sql)?;
    let rows = stmt.query_map(args, record_from_row)?;
    let mut out = Vec::new();
    for row in rows {
        out.push(decode_record(row?)?);
    }
    Ok(out)
}

impl<'s> Registry<'s> {
    pub fn open(store: &'s Store) -> Result<Self, CharterError> {
        db::initialize_registry_db(&store.registry_db_path())?;
        Ok(Self {
            store,
            broker: DbBroker::new(&store.audit_log_path()),
        })
    }

    fn connect(&self) -> Result<Connection, CharterError> {
        db::db_connect(&self.store.registry_db_path())
    }

    /// Create and initialize a new instance, then record it.
    pub fn create_instance(
        &self,
        catalog: &ModuleCatalog,
        config: &CharterConfig,
        request: CreateInstance,
    ) -> Result<(InstanceRecord, Instance), CharterError> {
        if request.name.trim().is_empty() {
            return Err(CharterError::ValidationError(Reason::MalformedPayload(
                "instance name must not be empty".to_string(),
            )));
        }
        if request.modules.is_empty() {
            return Err(CharterError::ValidationError(Reason::EmptyModuleList));
        }
        if request.modules.len() != request.init_payloads.len() {
            return Err(CharterError::ValidationError(Reason::PayloadCountMismatch {
                modules: request.modules.len(),
                payloads: request.init_payloads.len(),
            }));
        }

        let id = Ulid::new().to_string();
        let visibility = request
            .visibility
            .unwrap_or(config.registry.default_visibility);

        let mut instance = Instance::create(self.store, &id)?;
        let recorded = instance
            .initialize_unpublished(
                catalog,
                &request.modules,
                &request.init_payloads,
                &request.creator,
                &config.kernel,
            )
            .and_then(|notifications| self.insert_record(&id, visibility, &request, notifications));

        match recorded {
            Ok(record) => Ok((record, instance)),
            Err(e) => {
                // Cleanup is best effort; the creation error is reported.
                let _ = db::remove_db_files(&self.store.instance_db_path(&id));
                Err(e)
            }
        }
    }

    /// Insert the registry row and record the instance's init notifications
    /// followed by `instance_created`, all in one brokered transaction.
    fn insert_record(
        &self,
        id: &str,
        visibility: Visibility,
        request: &CreateInstance,
        mut notifications: Vec<Notification>,
    ) -> Result<InstanceRecord, CharterError> {
        let created_at = time::now_epoch_z();
        let modules_json = serde_json::to_string(&request.modules)?;
        notifications.push(Notification {
            name: "instance_created".to_string(),
            data: json!({
                "instance": id,
                "modules": request.modules,
                "visibility": visibility,
                "creator": request.creator,
            }),
        });
        let (idx, _) = self.broker.with_tx_publishing(
            &self.store.registry_db_path(),
            request.creator.as_str(),
            "registry.create",
            id,
            |conn| {
                conn.execute(
                    "INSERT INTO instances(id, name, description, visibility, label, creator, modules, created_at)
                     VALUES(?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                    params![
                        id,
                        request.name,
                        request.description,
                        visibility.as_str(),
                        request.label,
                        request.creator.as_str(),
                        modules_json,
                        created_at
                    ],
                )?;
                Ok((conn.last_insert_rowid(), notifications))
            },
        )?;
        Ok(InstanceRecord {
            index: (idx - 1).max(0) as u64,
            id: id.to_string(),
            name: request.name.clone(),
            description: request.description.clone(),
            visibility,
            label: request.label.clone(),
            creator: request.creator.clone(),
            modules: request.modules.clone(),
            created_at,
        })
    }

    /// Open a registered instance for routing.
    pub fn open_instance(&self, id: &str, catalog: &ModuleCatalog) -> Result<Instance, CharterError> {
        self.get(id)?;
        Instance::open(self.store, id, catalog)
    }

    pub fn count(&self) -> Result<u64, CharterError> {
        let conn = self.connect()?;
        let n: i64 = conn.query_row("SELECT COUNT(*) FROM instances", [], |row| row.get(0))?;
        Ok(n as u64)
    }

    pub fn get(&self, id: &str) -> Result<InstanceRecord, CharterError> {
        let conn = self.connect()?;
        let row = conn
            .query_row(
                &format!("{} WHERE id = ?1", SELECT_RECORD),
                params![id],
                record_from_row,
            )
            .optional()?;
        match row {
            Some(row) => decode_record(row),
            None => Err(CharterError::NotFound(Reason::UnknownInstance(id.to_string()))),
        }
    }

    /// Zero-based lookup in creation order.
    pub fn by_index(&self, index: u64) -> Result<InstanceRecord, CharterError> {
        let not_found = || CharterError::NotFound(Reason::UnknownInstance(format!("#{}", index)));
        let offset = i64::try_from(index).map_err(|_| not_found())?;
        let conn = self.connect()?;
        let mut records = query_records(
            &conn,
            &format!("{} ORDER BY idx LIMIT 1 OFFSET ?1", SELECT_RECORD),
            params![offset],
        )?;
        records.pop().ok_or_else(not_found)
    }

    /// Records matching every set field of `filter`, in creation order.
    pub fn list(&self, filter: &InstanceFilter) -> Result<Vec<InstanceRecord>, CharterError> {
        let conn = self.connect()?;
        let records = query_records(&conn, &format!("{} ORDER BY idx", SELECT_RECORD), [])?;
        Ok(records.into_iter().filter(|r| filter.matches(r)).collect())
    }
}
