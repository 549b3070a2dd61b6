//! The `napp.toml` entry file found in every NApp directory.

use kyco_event_system::NAppError;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

pub const MANIFEST_FILE: &str = "napp.toml";

/// Parsed entry file.
///
/// Exactly one of `entry` (a catalog factory) or `library` (a shared library
/// exporting the descriptor symbol) must be set.
///
/// ```toml
/// entry = "of_relay"
/// version = "0.3.0"
/// description = "Promotes raw switch data to inbound messages"
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NAppManifest {
    #[serde(default)]
    pub entry: Option<String>,
    #[serde(default)]
    pub library: Option<PathBuf>,
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
}

/// Where the descriptor for a NApp comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EntrySource {
    Catalog(String),
    Library(PathBuf),
}

impl NAppManifest {
    /// Reads and parses `<dir>/napp.toml`.
    pub async fn load(name: &str, dir: &Path) -> Result<Self, NAppError> {
        let path = dir.join(MANIFEST_FILE);
        let contents = tokio::fs::read_to_string(&path)
            .await
            .map_err(|e| NAppError::EntryNotFound {
                name: name.to_string(),
                reason: format!("cannot read {}: {}", path.display(), e),
            })?;

        Self::parse(name, &contents)
    }

    pub fn parse(name: &str, contents: &str) -> Result<Self, NAppError> {
        toml::from_str(contents).map_err(|e| NAppError::InvalidManifest {
            name: name.to_string(),
            reason: e.to_string(),
        })
    }

    /// Resolves the entry source. Relative library paths are taken from `dir`.
    pub fn source(&self, name: &str, dir: &Path) -> Result<EntrySource, NAppError> {
        match (&self.entry, &self.library) {
            (Some(entry), None) if !entry.trim().is_empty() => Ok(EntrySource::Catalog(entry.trim().to_string())),
            (None, Some(library)) => {
                let path = if library.is_absolute() {
                    library.clone()
                } else {
                    dir.join(library)
                };
                Ok(EntrySource::Library(path))
            }
            (Some(_), Some(_)) => Err(NAppError::InvalidManifest {
                name: name.to_string(),
                reason: "`entry` and `library` are mutually exclusive".to_string(),
            }),
            _ => Err(NAppError::InvalidManifest {
                name: name.to_string(),
                reason: "one of `entry` or `library` is required".to_string(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_catalog_entry() {
        let manifest = NAppManifest::parse("relay", "entry = \"of_relay\"\nversion = \"1.2.0\"\n")
            .expect("valid manifest");

        assert_eq!(manifest.version.as_deref(), Some("1.2.0"));
        assert_eq!(
            manifest.source("relay", Path::new("/napps/relay")).expect("source"),
            EntrySource::Catalog("of_relay".to_string())
        );
    }

    #[test]
    fn test_relative_library_path() {
        let manifest = NAppManifest::parse("stats", "library = \"libstats.so\"").expect("valid manifest");

        assert_eq!(
            manifest.source("stats", Path::new("/napps/stats")).expect("source"),
            EntrySource::Library(PathBuf::from("/napps/stats/libstats.so"))
        );
    }

    #[test]
    fn test_malformed_manifests() {
        assert!(matches!(
            NAppManifest::parse("bad", "entry = ["),
            Err(NAppError::InvalidManifest { .. })
        ));
        assert!(matches!(
            NAppManifest::parse("bad", "entrypoint = \"x\""),
            Err(NAppError::InvalidManifest { .. })
        ));

        let empty = NAppManifest::parse("empty", "").expect("empty table parses");
        assert!(matches!(
            empty.source("empty", Path::new(".")),
            Err(NAppError::InvalidManifest { .. })
        ));

        let both = NAppManifest::parse("both", "entry = \"a\"\nlibrary = \"b.so\"").expect("parses");
        assert!(both.source("both", Path::new(".")).is_err());
    }
}
