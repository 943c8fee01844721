use crate::core::error;
use crate::core::schemas;
use rusqlite::{Connection, OpenFlags};
use std::fs;
use std::path::Path;
use std::time::Duration;

/// Open a read-write connection: WAL journal, 5s busy wait, foreign keys on.
pub fn db_connect(db_path: &Path) -> Result<Connection, error::CharterError> {
    let conn = Connection::open(db_path)?;
    conn.busy_timeout(Duration::from_secs(5))?;
    conn.pragma_update_and_check(None, "journal_mode", "WAL", |_| Ok(()))?;
    conn.pragma_update(None, "foreign_keys", true)?;
    Ok(conn)
}

/// Open an existing database without write access.
pub fn db_open_read_only(db_path: &Path) -> Result<Connection, error::CharterError> {
    let conn = Connection::open_with_flags(
        db_path,
        OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
    )?;
    conn.busy_timeout(Duration::from_secs(5))?;
    Ok(conn)
}

fn ensure_parent(db_path: &Path) -> Result<(), error::CharterError> {
    if let Some(parent) = db_path.parent() {
        fs::create_dir_all(parent).map_err(error::CharterError::IoError)?;
    }
    Ok(())
}

pub fn initialize_registry_schema(conn: &Connection) -> Result<(), error::CharterError> {
    conn.execute(schemas::REGISTRY_DB_SCHEMA_INSTANCES, [])?;
    conn.execute(schemas::REGISTRY_DB_SCHEMA_INDEX_CREATOR, [])?;
    conn.execute(schemas::REGISTRY_DB_SCHEMA_INDEX_LABEL, [])?;
    Ok(())
}

pub fn initialize_instance_schema(conn: &Connection) -> Result<(), error::CharterError> {
    conn.execute(schemas::INSTANCE_DB_SCHEMA_KERNEL, [])?;
    conn.execute(schemas::INSTANCE_DB_SCHEMA_OPERATIONS, [])?;
    conn.execute(schemas::INSTANCE_DB_SCHEMA_SLOTS, [])?;
    Ok(())
}

/// Create the registry database file and tables if missing.
pub fn initialize_registry_db(db_path: &Path) -> Result<(), error::CharterError> {
    ensure_parent(db_path)?;
    let conn = db_connect(db_path)?;
    initialize_registry_schema(&conn)
}

/// Create an instance database file and tables if missing.
pub fn initialize_instance_db(db_path: &Path) -> Result<(), error::CharterError> {
    ensure_parent(db_path)?;
    let conn = db_connect(db_path)?;
    initialize_instance_schema(&conn)
}

/// Remove a database file together with its WAL side files.
pub fn remove_db_files(db_path: &Path) -> Result<(), error::CharterError> {
    let base = db_path.to_string_lossy().to_string();
    for path in [base.clone(), format!("{}-wal", base), format!("{}-shm", base)] {
        match fs::remove_file(&path) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(error::CharterError::IoError(e)),
        }
    }
    Ok(())
}
