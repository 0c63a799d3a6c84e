//! Broker properties file
//!
//! One `key=value` pair per line. Blank lines and lines starting with `#`
//! are skipped. Keys and values are trimmed; the value is everything after
//! the first `=`, so values may themselves contain `=`.

use crate::domain::BadgeError;
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Properties {
    entries: BTreeMap<String, String>,
}

impl Properties {
    /// Parse properties text
    pub fn parse(content: &str) -> Result<Self, BadgeError> {
        let mut entries = BTreeMap::new();

        for (idx, raw) in content.lines().enumerate() {
            let line = raw.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            let (key, value) = line.split_once('=').ok_or_else(|| {
                BadgeError::configuration(format!("properties line {}: missing '='", idx + 1))
            })?;

            let key = key.trim();
            if key.is_empty() {
                return Err(BadgeError::configuration(format!(
                    "properties line {}: empty key",
                    idx + 1
                )));
            }

            entries.insert(key.to_string(), value.trim().to_string());
        }

        Ok(Self { entries })
    }

    /// Load and parse a properties file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, BadgeError> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).map_err(|e| {
            BadgeError::configuration(format!(
                "failed to open properties file {}: {}",
                path.display(),
                e
            ))
        })?;
        Self::parse(&content)
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries.get(key).map(String::as_str)
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
