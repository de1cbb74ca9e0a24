//! Open-time configuration.
//!
//! Options are kept as a textual map, so a builder round-trips through the
//! same `key:value,…` grammar the file header uses. Keys the core does not
//! recognize are retained and ignored; compression and encryption are
//! byte-stream collaborators outside this crate, and their options simply
//! ride along.

use std::collections::BTreeMap;
use std::path::Path;

use format::map::{format_map, parse_map};

use crate::error::StoreError;
use crate::Store;

/// Builds and opens a [`Store`].
///
/// ```no_run
/// use store::Builder;
///
/// let store = Builder::new()
///     .file_name("data.tkv")
///     .cache_size_mb(32)
///     .open()
///     .unwrap();
/// ```
#[derive(Debug, Clone, Default)]
pub struct Builder {
    config: BTreeMap<String, String>,
}

impl Builder {
    /// A builder with no options set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// The backing file. Created if missing; the parent directory must
    /// exist. Required.
    #[must_use]
    pub fn file_name<P: AsRef<Path>>(mut self, path: P) -> Self {
        self.config.insert(
            "fileName".to_string(),
            path.as_ref().to_string_lossy().into_owned(),
        );
        self
    }

    /// Opens read-only with a shared file lock. Without this the file is
    /// locked exclusively. A store also falls back to read-only when the
    /// file is not writable or carries a newer write format.
    #[must_use]
    pub fn read_only(mut self) -> Self {
        self.config.insert("openMode".to_string(), "r".to_string());
        self
    }

    /// Read cache budget in MiB (default 16).
    #[must_use]
    pub fn cache_size_mb(mut self, mb: usize) -> Self {
        self.config.insert("cacheSize".to_string(), mb.to_string());
        self
    }

    /// Requests that page payloads be compressed by the external byte
    /// filter. Retained in the configuration; the core itself applies no
    /// compression.
    #[must_use]
    pub fn compress_data(mut self) -> Self {
        self.config.insert("compress".to_string(), "1".to_string());
        self
    }

    /// Sets an arbitrary option. Unknown keys are retained and ignored by
    /// the core.
    #[must_use]
    pub fn set<K: Into<String>, V: Into<String>>(mut self, key: K, value: V) -> Self {
        self.config.insert(key.into(), value.into());
        self
    }

    /// Opens the store.
    pub fn open(self) -> Result<Store, StoreError> {
        Store::open_with_config(self.config)
    }

    /// The configuration as a `key:value,…` string.
    #[must_use]
    pub fn to_config_string(&self) -> String {
        format_map(&self.config)
    }

    /// Rebuilds a builder from [`Builder::to_config_string`] output.
    pub fn from_config_string(s: &str) -> Result<Self, StoreError> {
        Ok(Self {
            config: parse_map(s)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_string_round_trip() {
        let b = Builder::new()
            .file_name("x.tkv")
            .cache_size_mb(4)
            .read_only()
            .set("custom", "kept");
        let s = b.to_config_string();
        let back = Builder::from_config_string(&s).unwrap();
        assert_eq!(back.to_config_string(), s);
        assert!(s.contains("fileName:x.tkv"));
        assert!(s.contains("openMode:r"));
        assert!(s.contains("custom:kept"));
    }

    #[test]
    fn missing_file_name_is_rejected() {
        assert!(matches!(
            Builder::new().open(),
            Err(StoreError::InvalidArgument(_))
        ));
    }
}
