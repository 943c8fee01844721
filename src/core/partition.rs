//! Storage partition scheme.
//!
//! All modules of an instance share one `slots` table. Each module type owns a
//! namespace string; the SHA-256 of that string names the module's partition
//! and every read or write a module performs is scoped to it. Two module types
//! that declare the same namespace would share a partition, so the kernel
//! rejects such module lists at registration time.

use crate::core::error::CharterError;
use rusqlite::{Connection, OptionalExtension, params};
use serde::Serialize;
use serde::de::DeserializeOwned;
use sha2::{Digest, Sha256};
use std::fmt;

/// Location of one module's region inside an instance's storage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PartitionId([u8; 32]);

impl PartitionId {
    pub fn for_namespace(namespace: &str) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(namespace.as_bytes());
        Self(hasher.finalize().into())
    }

    pub fn to_hex(&self) -> String {
        self.0.iter().map(|b| format!("{:02x}", b)).collect()
    }
}

impl fmt::Display for PartitionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

/// Typed key/value access to exactly one partition.
pub struct Partition<'a> {
    conn: &'a Connection,
    id: PartitionId,
    hex: String,
}

impl<'a> Partition<'a> {
    pub fn new(conn: &'a Connection, id: PartitionId) -> Self {
        Self {
            conn,
            id,
            hex: id.to_hex(),
        }
    }

    pub fn id(&self) -> PartitionId {
        self.id
    }

    pub fn get<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, CharterError> {
        let raw: Option<String> = self
            .conn
            .query_row(
                "SELECT value FROM slots WHERE partition = ?1 AND key = ?2",
                params![self.hex, key],
                |row| row.get(0),
            )
            .optional()?;
        match raw {
            Some(json) => Ok(Some(serde_json::from_str(&json)?)),
            None => Ok(None),
        }
    }

    pub fn get_or_default<T: DeserializeOwned + Default>(&self, key: &str) -> Result<T, CharterError> {
        Ok(self.get(key)?.unwrap_or_default())
    }

    pub fn set<T: Serialize + ?Sized>(&self, key: &str, value: &T) -> Result<(), CharterError> {
        let json = serde_json::to_string(value)?;
        self.conn.execute(
            "INSERT INTO slots(partition, key, value) VALUES(?1, ?2, ?3)
             ON CONFLICT(partition, key) DO UPDATE SET value = excluded.value",
            params![self.hex, key, json],
        )?;
        Ok(())
    }

    pub fn remove(&self, key: &str) -> Result<bool, CharterError> {
        let n = self.conn.execute(
            "DELETE FROM slots WHERE partition = ?1 AND key = ?2",
            params![self.hex, key],
        )?;
        Ok(n > 0)
    }

    pub fn contains(&self, key: &str) -> Result<bool, CharterError> {
        let found: Option<i64> = self
            .conn
            .query_row(
                "SELECT 1 FROM slots WHERE partition = ?1 AND key = ?2",
                params![self.hex, key],
                |row| row.get(0),
            )
            .optional()?;
        Ok(found.is_some())
    }

    /// Keys in this partition starting with `prefix`, in key order.
    pub fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>, CharterError> {
        let mut stmt = self.conn.prepare(
            "SELECT key FROM slots WHERE partition = ?1 AND substr(key, 1, length(?2)) = ?2 ORDER BY key",
        )?;
        let rows = stmt.query_map(params![self.hex, prefix], |row| row.get::<_, String>(0))?;
        let mut out = Vec::new();
        for key in rows {
            out.push(key?);
        }
        Ok(out)
    }
}
