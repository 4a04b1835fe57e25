//! Allow-list of peer identities for the server role.
//!
//! The file is YAML with a single recognized key:
//!
//! ```yaml
//! authorized_spiffe_ids:
//!   - spiffe://example.org/frontend
//!   - spiffe://example.org/batch
//! ```

use std::path::Path;

use serde::Deserialize;

use crate::config::{read_yaml, ConfigError};
use crate::error::{Error, Result};
use crate::observability::Logger;
use crate::prelude::{info, warn};
use crate::spiffe_id::SpiffeId;

#[derive(Debug, Default, Deserialize)]
struct AllowListFile {
    #[serde(default)]
    authorized_spiffe_ids: Vec<String>,
}

/// Ordered list of identities accepted by a server.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AllowList {
    ids: Vec<SpiffeId>,
}

impl AllowList {
    /// Builds a list from already-parsed identities.
    pub fn new(ids: impl IntoIterator<Item = SpiffeId>) -> Self {
        Self {
            ids: ids.into_iter().collect(),
        }
    }

    /// Loads the list at `path`. Any failure fails the whole file.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ConfigLoad`] if the file cannot be read, is not
    /// valid YAML or lists a malformed identity.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        Self::read(path).map_err(|source| Error::ConfigLoad {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Like [`AllowList::load`], but a failure is logged at warn and yields
    /// an empty list.
    ///
    /// An empty list makes the server fall back to accepting its own trust
    /// domain.
    pub fn load_or_empty(path: impl AsRef<Path>, logger: &Logger) -> Self {
        let path = path.as_ref();
        match Self::read(path) {
            Ok(list) => {
                info!(
                    logger,
                    "loaded allow-list: path={}, entries={}",
                    path.display(),
                    list.len()
                );
                list
            }
            Err(e) => {
                warn!(
                    logger,
                    "unable to load allowed SPIFFE IDs, continuing with an empty allow-list: path={}, error={}",
                    path.display(),
                    describe(&e)
                );
                Self::default()
            }
        }
    }

    /// Parses an allow-list document.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Yaml`] or [`ConfigError::InvalidSpiffeId`].
    pub fn from_yaml_str(yaml: &str) -> Result<Self, ConfigError> {
        let file: AllowListFile = serde_yaml::from_str(yaml).map_err(ConfigError::Yaml)?;
        Self::from_file(file)
    }

    fn read(path: &Path) -> Result<Self, ConfigError> {
        Self::from_file(read_yaml(path)?)
    }

    fn from_file(file: AllowListFile) -> Result<Self, ConfigError> {
        file.authorized_spiffe_ids
            .into_iter()
            .map(|value| match SpiffeId::new(&value) {
                Ok(id) => Ok(id),
                Err(source) => Err(ConfigError::InvalidSpiffeId { value, source }),
            })
            .collect::<Result<Vec<_>, _>>()
            .map(|ids| Self { ids })
    }

    /// Identities in file order.
    pub fn ids(&self) -> &[SpiffeId] {
        &self.ids
    }

    /// `true` if `id` is listed.
    pub fn contains(&self, id: &SpiffeId) -> bool {
        self.ids.contains(id)
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.ids.len()
    }

    /// `true` when nothing is listed.
    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }
}

fn describe(e: &ConfigError) -> String {
    match e {
        ConfigError::Io(source) => format!("{e}: {source}"),
        ConfigError::Yaml(source) => format!("{e}: {source}"),
        ConfigError::InvalidSpiffeId { source, .. } => format!("{e}: {source}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::observability::{Level, MemorySink};
    use std::io::Write as _;
    use std::sync::Arc;

    fn write_file(content: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(content.as_bytes()).unwrap();
        file
    }

    #[test]
    fn loads_in_file_order() {
        let file = write_file(
            "authorized_spiffe_ids:\n  - spiffe://example.org/b\n  - spiffe://example.org/a\n",
        );
        let list = AllowList::load(file.path()).unwrap();
        let ids: Vec<String> = list.ids().iter().map(ToString::to_string).collect();
        assert_eq!(ids, ["spiffe://example.org/b", "spiffe://example.org/a"]);
        assert!(list.contains(&SpiffeId::new("spiffe://example.org/a").unwrap()));
        assert!(!list.contains(&SpiffeId::new("spiffe://example.org/c").unwrap()));
    }

    #[test]
    fn missing_key_is_empty() {
        let list = AllowList::from_yaml_str("other_key: 1\n").unwrap();
        assert!(list.is_empty());
    }

    #[test]
    fn one_bad_entry_fails_the_whole_file() {
        let err = AllowList::from_yaml_str(
            "authorized_spiffe_ids:\n  - spiffe://example.org/a\n  - http://example.org/b\n",
        )
        .unwrap_err();
        match err {
            ConfigError::InvalidSpiffeId { value, .. } => assert_eq!(value, "http://example.org/b"),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn strict_load_reports_the_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("allowed.yaml");
        match AllowList::load(&path).unwrap_err() {
            Error::ConfigLoad { path: p, .. } => assert_eq!(p, path),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn unreadable_file_degrades_with_a_warning() {
        let sink = MemorySink::new();
        let logger = Logger::new(Arc::clone(&sink));
        let dir = tempfile::tempdir().unwrap();

        let list = AllowList::load_or_empty(dir.path().join("absent.yaml"), &logger);

        assert!(list.is_empty());
        let warnings = sink.at(Level::Warn);
        assert_eq!(warnings.len(), 1);
        assert!(warnings[0].contains("absent.yaml"));
    }

    #[test]
    fn malformed_yaml_degrades_with_a_warning() {
        let sink = MemorySink::new();
        let logger = Logger::new(Arc::clone(&sink));
        let file = write_file("authorized_spiffe_ids: [unterminated\n");

        assert!(AllowList::load_or_empty(file.path(), &logger).is_empty());
        assert_eq!(sink.at(Level::Warn).len(), 1);
    }
}
