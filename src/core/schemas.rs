//! Centralized database schema definitions.
//!
//! Charter keeps two kinds of SQLite databases:
//! 1. registry.db: one row per created instance with its descriptive metadata.
//! 2. instances/<id>.db: one instance's storage address space (kernel state,
//!    operation map and the partitioned slot table shared by all modules).

pub const REGISTRY_DB_NAME: &str = "registry.db";
pub const INSTANCES_DIR_NAME: &str = "instances";
pub const AUDIT_LOG_NAME: &str = "broker.events.jsonl";

// --- Registry ---

pub const REGISTRY_DB_SCHEMA_INSTANCES: &str = "
    CREATE TABLE IF NOT EXISTS instances (
        idx INTEGER PRIMARY KEY AUTOINCREMENT,
        id TEXT NOT NULL UNIQUE,
        name TEXT NOT NULL,
        description TEXT NOT NULL,
        visibility TEXT NOT NULL,
        label TEXT NOT NULL,
        creator TEXT NOT NULL,
        modules TEXT NOT NULL, -- JSON array of module ids
        created_at TEXT NOT NULL
    )
";
pub const REGISTRY_DB_SCHEMA_INDEX_CREATOR: &str =
    "CREATE INDEX IF NOT EXISTS idx_instances_creator ON instances(creator)";
pub const REGISTRY_DB_SCHEMA_INDEX_LABEL: &str =
    "CREATE INDEX IF NOT EXISTS idx_instances_label ON instances(label)";

// --- Instance ---

pub const INSTANCE_DB_SCHEMA_KERNEL: &str = "
    CREATE TABLE IF NOT EXISTS kernel (
        key TEXT PRIMARY KEY,
        value TEXT NOT NULL
    )
";
pub const INSTANCE_DB_SCHEMA_OPERATIONS: &str = "
    CREATE TABLE IF NOT EXISTS operations (
        tag TEXT PRIMARY KEY,
        name TEXT NOT NULL,
        module TEXT NOT NULL
    )
";
pub const INSTANCE_DB_SCHEMA_SLOTS: &str = "
    CREATE TABLE IF NOT EXISTS slots (
        partition TEXT NOT NULL, -- hex sha256 of the owning module's namespace
        key TEXT NOT NULL,
        value TEXT NOT NULL,     -- JSON
        PRIMARY KEY (partition, key)
    )
";
