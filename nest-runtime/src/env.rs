//! Process-wide string environment.
//!
//! A small insert-ordered key/value store consulted for runtime
//! configuration (`thread`, `harbor`, `bootstrap`, ...) and exposed to
//! services through the GETENV / SETENV commands. Keys are append-only:
//! a second SETENV for an existing key leaves the first value in place,
//! which keeps configuration immutable once a service has observed it.

use std::sync::RwLock;

/// Insert-ordered key/value store behind a read/write lock.
#[derive(Debug, Default)]
pub struct EnvStore {
    entries: RwLock<Vec<(String, String)>>,
}

impl EnvStore {
    #[must_use]
    pub fn new() -> EnvStore {
        EnvStore::default()
    }

    /// Look up `key`, returning an owned copy of the value.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<String> {
        let entries = self.entries.read().unwrap_or_else(|e| e.into_inner());
        entries
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.clone())
    }

    /// Insert `key` unless it is already present. Returns `true` when the
    /// value was stored.
    pub fn set(&self, key: &str, value: &str) -> bool {
        let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
        if entries.iter().any(|(k, _)| k == key) {
            return false;
        }
        entries.push((key.to_owned(), value.to_owned()));
        true
    }

    /// Read-through default: return the stored value for `key`, or store
    /// and return `default`.
    #[must_use]
    pub fn get_or(&self, key: &str, default: &str) -> String {
        {
            let entries = self.entries.read().unwrap_or_else(|e| e.into_inner());
            if let Some((_, v)) = entries.iter().find(|(k, _)| k == key) {
                return v.clone();
            }
        }
        let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
        // A writer may have raced us between the two locks.
        if let Some((_, v)) = entries.iter().find(|(k, _)| k == key) {
            return v.clone();
        }
        entries.push((key.to_owned(), default.to_owned()));
        default.to_owned()
    }

    /// Integer read-through default.
    #[must_use]
    pub fn get_or_int(&self, key: &str, default: i64) -> i64 {
        let text = self.get_or(key, &default.to_string());
        text.trim().parse().unwrap_or(default)
    }

    /// Boolean read-through default (`true` / `false` literals).
    #[must_use]
    pub fn get_or_bool(&self, key: &str, default: bool) -> bool {
        let text = self.get_or(key, if default { "true" } else { "false" });
        match text.trim() {
            "true" | "1" => true,
            "false" | "0" => false,
            _ => default,
        }
    }
}
