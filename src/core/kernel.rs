//! Dispatch kernel.
//!
//! An instance owns one operation map, built exactly once by `initialize`, that
//! sends each operation tag to the module implementing it. Every dispatched
//! call executes against the instance's own storage, scoped to the target
//! module's partition, and observes the original external caller.
//!
//! Modules resolve other modules' answers with [`ExecContext::query`], which
//! looks the operation up in the same map in-process instead of re-entering the
//! external call boundary.

use crate::core::address::Address;
use crate::core::broker::{DbBroker, Notification};
use crate::core::config::{KernelConfig, OperationConflicts};
use crate::core::db;
use crate::core::error::{CharterError, Reason};
use crate::core::partition::{Partition, PartitionId};
use crate::core::store::Store;
use crate::core::time;
use rusqlite::{Connection, OptionalExtension, params};
use rustc_hash::{FxHashMap, FxHashSet};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

/// Nested cross-module queries deeper than this are refused.
pub const MAX_QUERY_DEPTH: usize = 4;

const KERNEL_KEY_INITIALIZED: &str = "initialized";
const KERNEL_KEY_INITIALIZED_AT: &str = "initialized_at";
const KERNEL_KEY_MODULES: &str = "modules";

/// Four-byte routing tag derived from an operation name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct OpTag([u8; 4]);

impl OpTag {
    pub fn of(operation: &str) -> Self {
        let digest = Sha256::digest(operation.as_bytes());
        Self([digest[0], digest[1], digest[2], digest[3]])
    }

    /// Accept either a `0x`-prefixed tag or an operation name.
    pub fn from_name_or_tag(input: &str) -> Self {
        input.parse().unwrap_or_else(|_| OpTag::of(input))
    }
}

impl fmt::Display for OpTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x")?;
        for b in self.0 {
            write!(f, "{:02x}", b)?;
        }
        Ok(())
    }
}

impl FromStr for OpTag {
    type Err = CharterError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let malformed = || CharterError::ValidationError(Reason::MalformedPayload(format!("bad operation tag {}", s)));
        let hex = s.strip_prefix("0x").ok_or_else(malformed)?;
        if hex.len() != 8 || !hex.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(malformed());
        }
        let mut bytes = [0u8; 4];
        for (i, byte) in bytes.iter_mut().enumerate() {
            *byte = u8::from_str_radix(&hex[i * 2..i * 2 + 2], 16).map_err(|_| malformed())?;
        }
        Ok(Self(bytes))
    }
}

/// Contract every capability module publishes to the kernel.
pub trait Module: Send + Sync {
    /// Identity used in module lists and the persisted operation map.
    fn id(&self) -> &'static str;

    /// Namespace whose hash names this module's storage partition.
    fn namespace(&self) -> &'static str;

    /// Operation names this module implements.
    fn operations(&self) -> &'static [&'static str];

    /// One-time initialization with the module's own payload.
    fn init(&self, ctx: &mut ExecContext<'_>, payload: &Value) -> Result<(), CharterError>;

    /// Execute one declared operation.
    fn call(
        &self,
        ctx: &mut ExecContext<'_>,
        operation: &str,
        payload: &Value,
    ) -> Result<Value, CharterError>;
}

/// The closed set of module implementations a process knows about.
#[derive(Default, Clone)]
pub struct ModuleCatalog {
    modules: Vec<&'static dyn Module>,
}

impl ModuleCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, module: &'static dyn Module) -> Self {
        self.modules.retain(|m| m.id() != module.id());
        self.modules.push(module);
        self
    }

    pub fn get(&self, id: &str) -> Option<&'static dyn Module> {
        self.modules.iter().copied().find(|m| m.id() == id)
    }

    pub fn modules(&self) -> &[&'static dyn Module] {
        &self.modules
    }

    pub fn resolve(&self, ids: &[String]) -> Result<Vec<&'static dyn Module>, CharterError> {
        ids.iter()
            .map(|id| {
                self.get(id)
                    .ok_or_else(|| CharterError::ValidationError(Reason::UnknownModule(id.clone())))
            })
            .collect()
    }
}

/// Reject module lists in which two modules would share a partition.
pub fn check_namespaces(modules: &[&'static dyn Module]) -> Result<(), CharterError> {
    let mut seen = FxHashSet::default();
    for module in modules {
        if !seen.insert(module.namespace()) {
            return Err(CharterError::ValidationError(Reason::NamespaceCollision(
                module.namespace().to_string(),
            )));
        }
    }
    Ok(())
}

#[derive(Clone, Copy)]
pub struct OperationEntry {
    pub tag: OpTag,
    pub name: &'static str,
    pub module: &'static dyn Module,
    pub partition: PartitionId,
}

impl fmt::Debug for OperationEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OperationEntry")
            .field("tag", &self.tag)
            .field("name", &self.name)
            .field("module", &self.module.id())
            .finish()
    }
}

/// Serializable view of one operation map entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperationInfo {
    pub tag: String,
    pub name: String,
    pub module: String,
}

#[derive(Debug, Default)]
pub struct OperationMap {
    entries: FxHashMap<OpTag, OperationEntry>,
}

impl OperationMap {
    /// Insert every operation `module` declares.
    pub fn register(
        &mut self,
        module: &'static dyn Module,
        conflicts: OperationConflicts,
    ) -> Result<(), CharterError> {
        let partition = PartitionId::for_namespace(module.namespace());
        for &name in module.operations() {
            let tag = OpTag::of(name);
            if let Some(existing) = self.entries.get(&tag) {
                if conflicts == OperationConflicts::Reject && existing.module.id() != module.id() {
                    return Err(CharterError::ValidationError(Reason::OperationCollision(format!(
                        "{} ({}) declared by {} and {}",
                        tag,
                        name,
                        existing.module.id(),
                        module.id()
                    ))));
                }
            }
            self.entries.insert(
                tag,
                OperationEntry {
                    tag,
                    name,
                    module,
                    partition,
                },
            );
        }
        Ok(())
    }

    pub fn resolve(&self, tag: OpTag) -> Option<&OperationEntry> {
        self.entries.get(&tag)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Entries sorted by tag.
    pub fn entries(&self) -> Vec<OperationInfo> {
        let mut out: Vec<&OperationEntry> = self.entries.values().collect();
        out.sort_by_key(|e| e.tag);
        out.into_iter()
            .map(|e| OperationInfo {
                tag: e.tag.to_string(),
                name: e.name.to_string(),
                module: e.module.id().to_string(),
            })
            .collect()
    }

    fn persist(&self, conn: &Connection) -> Result<(), CharterError> {
        for info in self.entries() {
            conn.execute(
                "INSERT INTO operations(tag, name, module) VALUES(?1, ?2, ?3)",
                params![info.tag, info.name, info.module],
            )?;
        }
        Ok(())
    }

    fn load(conn: &Connection, catalog: &ModuleCatalog) -> Result<Self, CharterError> {
        let mut stmt = conn.prepare("SELECT tag, name, module FROM operations")?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
            ))
        })?;

        let mut map = OperationMap::default();
        for row in rows {
            let (tag, name, module_id) = row?;
            let tag: OpTag = tag.parse()?;
            let module = catalog
                .get(&module_id)
                .ok_or_else(|| CharterError::ValidationError(Reason::UnknownModule(module_id.clone())))?;
            let name = module
                .operations()
                .iter()
                .copied()
                .find(|op| *op == name)
                .ok_or_else(|| CharterError::NotFound(Reason::UnknownOperation(name.clone())))?;
            map.entries.insert(
                tag,
                OperationEntry {
                    tag,
                    name,
                    module,
                    partition: PartitionId::for_namespace(module.namespace()),
                },
            );
        }
        Ok(map)
    }
}

/// Execution context threaded through every dispatched call.
///
/// Carries the original caller, the instance's storage scoped to the executing
/// module's partition, and the instance's operation map for in-process queries.
pub struct ExecContext<'a> {
    instance: &'a str,
    caller: &'a Address,
    timestamp: u64,
    conn: &'a Connection,
    ops: &'a OperationMap,
    storage: Partition<'a>,
    notifications: &'a mut Vec<Notification>,
    depth: usize,
}

impl<'a> ExecContext<'a> {
    pub fn new(
        instance: &'a str,
        caller: &'a Address,
        timestamp: u64,
        conn: &'a Connection,
        ops: &'a OperationMap,
        partition: PartitionId,
        notifications: &'a mut Vec<Notification>,
    ) -> Self {
        Self {
            instance,
            caller,
            timestamp,
            conn,
            ops,
            storage: Partition::new(conn, partition),
            notifications,
            depth: 0,
        }
    }

    pub fn instance_id(&self) -> &str {
        self.instance
    }

    /// The external caller of the current call, never the kernel.
    pub fn caller(&self) -> &Address {
        self.caller
    }

    /// Epoch seconds captured when the external call began.
    pub fn timestamp(&self) -> u64 {
        self.timestamp
    }

    pub fn storage(&self) -> &Partition<'a> {
        &self.storage
    }

    pub fn emit(&mut self, name: &str, data: Value) {
        self.notifications.push(Notification {
            name: name.to_string(),
            data,
        });
    }

    /// Ask the instance to run `operation` on behalf of the same caller.
    ///
    /// Resolved through the instance's operation map and executed inside the
    /// same transaction; a failure here fails the enclosing call. Queries are
    /// expected to be read-only but this is not enforced.
    pub fn query(&mut self, operation: &str, payload: Value) -> Result<Value, CharterError> {
        if self.depth >= MAX_QUERY_DEPTH {
            return Err(CharterError::StateError(Reason::QueryDepthExceeded));
        }
        let entry = *self
            .ops
            .resolve(OpTag::of(operation))
            .ok_or_else(|| CharterError::NotFound(Reason::UnknownOperation(operation.to_string())))?;
        let mut nested = ExecContext {
            instance: self.instance,
            caller: self.caller,
            timestamp: self.timestamp,
            conn: self.conn,
            ops: self.ops,
            storage: Partition::new(self.conn, entry.partition),
            notifications: &mut *self.notifications,
            depth: self.depth + 1,
        };
        entry.module.call(&mut nested, entry.name, &payload)
    }
}

/// Decode a JSON payload into an operation's argument struct.
pub fn decode_payload<T: DeserializeOwned>(payload: &Value) -> Result<T, CharterError> {
    let value = if payload.is_null() {
        Value::Object(Default::default())
    } else {
        payload.clone()
    };
    serde_json::from_value(value)
        .map_err(|e| CharterError::ValidationError(Reason::MalformedPayload(e.to_string())))
}

/// Result of one successfully routed call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallReceipt {
    pub instance: String,
    pub operation: String,
    pub tag: String,
    pub caller: String,
    pub result: Value,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub notifications: Vec<Notification>,
}

/// One governed instance: its storage address space and its operation map.
pub struct Instance {
    id: String,
    db_path: PathBuf,
    broker: DbBroker,
    ops: Option<OperationMap>,
}

impl Instance {
    /// Create the storage for a fresh, uninitialized instance.
    pub fn create(store: &Store, id: &str) -> Result<Self, CharterError> {
        let db_path = store.instance_db_path(id);
        db::initialize_instance_db(&db_path)?;
        Ok(Self {
            id: id.to_string(),
            db_path,
            broker: DbBroker::new(&store.audit_log_path()),
            ops: None,
        })
    }

    /// Open an existing instance, rebuilding its operation map if initialized.
    pub fn open(store: &Store, id: &str, catalog: &ModuleCatalog) -> Result<Self, CharterError> {
        let db_path = store.instance_db_path(id);
        if !db_path.exists() {
            return Err(CharterError::NotFound(Reason::UnknownInstance(id.to_string())));
        }
        let conn = db::db_open_read_only(&db_path)?;
        let ops = if is_initialized(&conn)? {
            Some(OperationMap::load(&conn, catalog)?)
        } else {
            None
        };
        Ok(Self {
            id: id.to_string(),
            db_path,
            broker: DbBroker::new(&store.audit_log_path()),
            ops,
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn is_initialized(&self) -> bool {
        self.ops.is_some()
    }

    pub fn operations(&self) -> Vec<OperationInfo> {
        self.ops.as_ref().map(OperationMap::entries).unwrap_or_default()
    }

    /// One-time initialization: build the operation map and run every module's
    /// init against this instance's storage. All-or-nothing.
    pub fn initialize(
        &mut self,
        catalog: &ModuleCatalog,
        module_ids: &[String],
        init_payloads: &[Value],
        caller: &Address,
        config: &KernelConfig,
    ) -> Result<Vec<Notification>, CharterError> {
        self.run_initialize(catalog, module_ids, init_payloads, caller, config, true)
    }

    /// Initialize without recording the modules' notifications; the caller
    /// publishes them together with its own follow-up transaction.
    pub(crate) fn initialize_unpublished(
        &mut self,
        catalog: &ModuleCatalog,
        module_ids: &[String],
        init_payloads: &[Value],
        caller: &Address,
        config: &KernelConfig,
    ) -> Result<Vec<Notification>, CharterError> {
        self.run_initialize(catalog, module_ids, init_payloads, caller, config, false)
    }

    fn run_initialize(
        &mut self,
        catalog: &ModuleCatalog,
        module_ids: &[String],
        init_payloads: &[Value],
        caller: &Address,
        config: &KernelConfig,
        publish: bool,
    ) -> Result<Vec<Notification>, CharterError> {
        let instance_id = self.id.clone();
        let timestamp = time::now_epoch_secs();

        let ((map, notifications), _) = self.broker.with_tx_publishing(
            &self.db_path,
            caller.as_str(),
            "kernel.initialize",
            &self.id,
            |conn| {
                if is_initialized(conn)? {
                    return Err(CharterError::StateError(Reason::AlreadyInitialized));
                }
                if module_ids.is_empty() {
                    return Err(CharterError::ValidationError(Reason::EmptyModuleList));
                }
                if module_ids.len() != init_payloads.len() {
                    return Err(CharterError::ValidationError(Reason::PayloadCountMismatch {
                        modules: module_ids.len(),
                        payloads: init_payloads.len(),
                    }));
                }
                let modules = catalog.resolve(module_ids)?;
                check_namespaces(&modules)?;

                let mut map = OperationMap::default();
                let mut notifications = Vec::new();
                for (module, payload) in modules.iter().zip(init_payloads) {
                    map.register(*module, config.operation_conflicts)?;
                    let mut ctx = ExecContext::new(
                        &instance_id,
                        caller,
                        timestamp,
                        conn,
                        &map,
                        PartitionId::for_namespace(module.namespace()),
                        &mut notifications,
                    );
                    module.init(&mut ctx, payload)?;
                }

                map.persist(conn)?;
                set_kernel_value(conn, KERNEL_KEY_MODULES, &serde_json::to_string(module_ids)?)?;
                set_kernel_value(conn, KERNEL_KEY_INITIALIZED_AT, &timestamp.to_string())?;
                set_kernel_value(conn, KERNEL_KEY_INITIALIZED, "true")?;

                let published = if publish { notifications.clone() } else { Vec::new() };
                Ok(((map, notifications), published))
            },
        )?;

        self.ops = Some(map);
        Ok(notifications)
    }

    /// Route one external call by tag.
    pub fn route(
        &self,
        tag: OpTag,
        payload: &Value,
        caller: &Address,
    ) -> Result<CallReceipt, CharterError> {
        let timestamp = time::now_epoch_secs();
        let op_name = format!("route.{}", tag);

        let ((name, result), notifications) = self.broker.with_tx_publishing(
            &self.db_path,
            caller.as_str(),
            &op_name,
            &self.id,
            |conn| {
                let ops = self
                    .ops
                    .as_ref()
                    .ok_or(CharterError::StateError(Reason::NotInitialized))?;
                let entry = ops
                    .resolve(tag)
                    .ok_or_else(|| CharterError::NotFound(Reason::UnknownOperation(tag.to_string())))?;
                let mut notifications = Vec::new();
                let mut ctx = ExecContext::new(
                    &self.id,
                    caller,
                    timestamp,
                    conn,
                    ops,
                    entry.partition,
                    &mut notifications,
                );
                let result = entry.module.call(&mut ctx, entry.name, payload)?;
                Ok(((entry.name, result), notifications))
            },
        )?;

        Ok(CallReceipt {
            instance: self.id.clone(),
            operation: name.to_string(),
            tag: tag.to_string(),
            caller: caller.to_string(),
            result,
            notifications,
        })
    }

    /// Route by operation name or `0x` tag.
    pub fn call(
        &self,
        operation: &str,
        payload: &Value,
        caller: &Address,
    ) -> Result<CallReceipt, CharterError> {
        self.route(OpTag::from_name_or_tag(operation), payload, caller)
    }
}

fn is_initialized(conn: &Connection) -> Result<bool, CharterError> {
    let value: Option<String> = conn
        .query_row(
            "SELECT value FROM kernel WHERE key = ?1",
            params![KERNEL_KEY_INITIALIZED],
            |row| row.get(0),
        )
        .optional()?;
    Ok(value.as_deref() == Some("true"))
}

fn set_kernel_value(conn: &Connection, key: &str, value: &str) -> Result<(), CharterError> {
    conn.execute(
        "INSERT INTO kernel(key, value) VALUES(?1, ?2)
         ON CONFLICT(key) DO UPDATE SET value = excluded.value",
        params![key, value],
    )?;
    Ok(())
}
