//! Fixture loading and the mapping catalog.
//!
//! Fixtures are JSON documents, one per file, grouped in category
//! directories. The default set is compiled into the binary; a directory on
//! disk with the same layout can replace it. A category that cannot be read
//! is logged and treated as empty; a single malformed file is logged and
//! skipped.

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};

use elk_common::{FieldSpec, MEMORY_METRIC, MappingDescriptor, SavedObject};
use rust_embed::RustEmbed;
use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, warn};

/// Errors that can occur while reading fixtures.
#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("Failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// Fixture categories.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FixtureKind {
    /// One field declaration per metric type.
    Mappings,
    /// Index-pattern templates.
    Indexes,
    /// Visualization templates.
    Charts,
    /// Dashboard templates.
    Dashboards,
}

impl FixtureKind {
    pub fn dir_name(&self) -> &'static str {
        match self {
            FixtureKind::Mappings => "mappings",
            FixtureKind::Indexes => "indexes",
            FixtureKind::Charts => "charts",
            FixtureKind::Dashboards => "dashboards",
        }
    }
}

/// A fixture document and the file stem it was read from.
#[derive(Debug, Clone, PartialEq)]
pub struct Fixture {
    pub name: String,
    pub value: Value,
}

/// Fixtures compiled into the binary from the crate's `fixtures/` tree.
#[derive(RustEmbed)]
#[folder = "fixtures/"]
struct ShippedFixtures;

/// Where fixture categories are read from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Fixtures {
    /// The fixtures built into the binary.
    Shipped,
    /// Category directories under a root on disk.
    Dir(PathBuf),
}

impl Fixtures {
    pub fn shipped() -> Self {
        Fixtures::Shipped
    }

    pub fn dir(root: impl Into<PathBuf>) -> Self {
        Fixtures::Dir(root.into())
    }

    /// A configured root directory, or the shipped fixtures when none is set.
    pub fn from_config(root: Option<&Path>) -> Self {
        match root {
            Some(root) => Fixtures::dir(root),
            None => Fixtures::Shipped,
        }
    }

    /// Reads every `.json` fixture of a category, sorted by file name.
    ///
    /// Fails only when a category directory on disk cannot be listed.
    pub fn try_load(&self, kind: FixtureKind) -> Result<Vec<Fixture>, CatalogError> {
        match self {
            Fixtures::Shipped => Ok(load_shipped(kind)),
            Fixtures::Dir(root) => load_dir(&root.join(kind.dir_name())),
        }
    }

    /// Like `try_load`, but an unreadable category is logged and empty.
    pub fn load(&self, kind: FixtureKind) -> Vec<Fixture> {
        match self.try_load(kind) {
            Ok(fixtures) => {
                debug!(category = kind.dir_name(), count = fixtures.len(), "Loaded fixtures");
                fixtures
            }
            Err(e) => {
                warn!(error = %e, "Fixture category unavailable");
                Vec::new()
            }
        }
    }

    /// Loads a category of saved object templates, skipping malformed ones.
    pub fn load_saved_objects(&self, kind: FixtureKind) -> Vec<SavedObject> {
        self.load(kind)
            .into_iter()
            .filter_map(|fixture| match SavedObject::from_generic(&fixture.value) {
                Ok(obj) => Some(obj),
                Err(e) => {
                    warn!(fixture = %fixture.name, error = %e, "Invalid saved object template");
                    None
                }
            })
            .collect()
    }
}

impl fmt::Display for Fixtures {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Fixtures::Shipped => write!(f, "shipped"),
            Fixtures::Dir(root) => write!(f, "{}", root.display()),
        }
    }
}

fn load_shipped(kind: FixtureKind) -> Vec<Fixture> {
    let prefix = format!("{}/", kind.dir_name());
    let mut names: Vec<String> = ShippedFixtures::iter()
        .filter(|name| name.starts_with(&prefix) && name.ends_with(".json"))
        .map(|name| name.into_owned())
        .collect();
    names.sort();

    let mut fixtures = Vec::with_capacity(names.len());
    for name in names {
        let Some(file) = ShippedFixtures::get(&name) else {
            continue;
        };
        match serde_json::from_slice(&file.data) {
            Ok(value) => fixtures.push(Fixture {
                name: fixture_name(Path::new(&name)),
                value,
            }),
            Err(source) => {
                let e = CatalogError::Parse {
                    path: PathBuf::from(&name),
                    source,
                };
                warn!(error = %e, "Skipping fixture");
            }
        }
    }
    fixtures
}

fn load_dir(dir: &Path) -> Result<Vec<Fixture>, CatalogError> {
    let entries = std::fs::read_dir(dir).map_err(|source| CatalogError::Io {
        path: dir.to_path_buf(),
        source,
    })?;

    let mut paths: Vec<PathBuf> = entries
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|path| path.extension().is_some_and(|ext| ext == "json"))
        .collect();
    paths.sort();

    let mut fixtures = Vec::with_capacity(paths.len());
    for path in paths {
        match read_fixture(&path) {
            Ok(fixture) => fixtures.push(fixture),
            Err(e) => warn!(error = %e, "Skipping fixture"),
        }
    }

    Ok(fixtures)
}

fn read_fixture(path: &Path) -> Result<Fixture, CatalogError> {
    let content = std::fs::read_to_string(path).map_err(|source| CatalogError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let value = serde_json::from_str(&content).map_err(|source| CatalogError::Parse {
        path: path.to_path_buf(),
        source,
    })?;

    Ok(Fixture {
        name: fixture_name(path),
        value,
    })
}

fn fixture_name(path: &Path) -> String {
    path.file_stem()
        .map(|stem| stem.to_string_lossy().into_owned())
        .unwrap_or_default()
}

/// On-disk shape of a mapping fixture; the metric type is the file stem.
#[derive(Debug, Deserialize)]
struct MappingFixture {
    properties: BTreeMap<String, FieldSpec>,
}

/// Immutable map from metric type to its declared fields.
#[derive(Debug, Clone, Default)]
pub struct MappingCatalog {
    descriptors: BTreeMap<String, MappingDescriptor>,
}

impl MappingCatalog {
    /// Loads every mapping fixture of `fixtures`.
    pub fn load(fixtures: &Fixtures) -> Self {
        let mut descriptors = Vec::new();
        for fixture in fixtures.load(FixtureKind::Mappings) {
            match serde_json::from_value::<MappingFixture>(fixture.value) {
                Ok(mapping) => {
                    descriptors.push(MappingDescriptor::new(fixture.name, mapping.properties))
                }
                Err(e) => warn!(metric = %fixture.name, error = %e, "Invalid mapping fixture"),
            }
        }
        Self::from_descriptors(descriptors)
    }

    pub fn from_descriptors(descriptors: impl IntoIterator<Item = MappingDescriptor>) -> Self {
        Self {
            descriptors: descriptors
                .into_iter()
                .map(|d| (d.metric_type.clone(), d))
                .collect(),
        }
    }

    pub fn get(&self, metric_type: &str) -> Option<&MappingDescriptor> {
        self.descriptors.get(metric_type)
    }

    pub fn contains(&self, metric_type: &str) -> bool {
        self.descriptors.contains_key(metric_type)
    }

    /// Metric types in name order.
    pub fn metric_types(&self) -> impl Iterator<Item = &str> {
        self.descriptors.keys().map(String::as_str)
    }

    pub fn descriptors(&self) -> impl Iterator<Item = &MappingDescriptor> {
        self.descriptors.values()
    }

    /// Descriptors whose events are forwarded through their field allowlist.
    pub fn declarative(&self) -> impl Iterator<Item = &MappingDescriptor> {
        self.descriptors
            .values()
            .filter(|d| d.metric_type != MEMORY_METRIC)
    }

    pub fn len(&self) -> usize {
        self.descriptors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.descriptors.is_empty()
    }
}
