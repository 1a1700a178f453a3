//! Descriptor index keyed by `(id, version)`, plus on-disk loading of
//! buildpack directories and platform `order.toml` files.

use crate::descriptor::{parse_descriptor_file, Descriptor, DescriptorError};
use crate::group::Order;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

const DESCRIPTOR_FILE: &str = "buildpack.toml";

/// All buildpack descriptors known to a resolution.
#[derive(Debug, Clone, Default)]
pub struct Catalog {
    entries: BTreeMap<(String, String), Descriptor>,
}

impl Catalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a descriptor, replacing any earlier one with the same `(id, version)`.
    pub fn insert(&mut self, descriptor: Descriptor) {
        let key = (
            descriptor.buildpack.id.clone(),
            descriptor.buildpack.version.clone(),
        );
        if self.entries.insert(key, descriptor).is_some() {
            debug!("replaced an existing catalog entry");
        }
    }

    pub fn get(&self, id: &str, version: &str) -> Option<&Descriptor> {
        self.entries.get(&(id.to_owned(), version.to_owned()))
    }

    /// All versions present for `id`, in ascending key order.
    pub fn versions(&self, id: &str) -> Vec<&str> {
        self.entries
            .keys()
            .filter(|(k, _)| k == id)
            .map(|(_, v)| v.as_str())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Descriptor> {
        self.entries.values()
    }

    /// Load every `<escaped-id>/<version>/buildpack.toml` under `dir`.
    ///
    /// Directories without a descriptor file are skipped.
    pub fn load_dir(dir: &Path) -> Result<Self, DescriptorError> {
        let mut catalog = Self::new();
        for id_dir in sorted_subdirs(dir)? {
            for version_dir in sorted_subdirs(&id_dir)? {
                let path = version_dir.join(DESCRIPTOR_FILE);
                if !path.is_file() {
                    warn!("no {DESCRIPTOR_FILE} in {}", version_dir.display());
                    continue;
                }
                let descriptor = parse_descriptor_file(&path)?;
                debug!("loaded {} from {}", descriptor, path.display());
                catalog.insert(descriptor);
            }
        }
        Ok(catalog)
    }
}

impl FromIterator<Descriptor> for Catalog {
    fn from_iter<T: IntoIterator<Item = Descriptor>>(iter: T) -> Self {
        let mut catalog = Self::new();
        for descriptor in iter {
            catalog.insert(descriptor);
        }
        catalog
    }
}

/// Directory name used for a buildpack id; `/` is not allowed in path segments.
pub fn escape_id(id: &str) -> String {
    id.replace('/', "_")
}

fn sorted_subdirs(dir: &Path) -> Result<Vec<PathBuf>, DescriptorError> {
    let mut dirs = Vec::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        if entry.file_type()?.is_dir() {
            dirs.push(entry.path());
        }
    }
    dirs.sort();
    Ok(dirs)
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct OrderFile {
    #[serde(default)]
    order: Order,
}

/// Parse a platform `order.toml`.
pub fn parse_order_str(input: &str) -> Result<Order, DescriptorError> {
    let file: OrderFile = toml::from_str(input)?;
    Ok(file.order)
}

pub fn parse_order_file(path: impl AsRef<Path>) -> Result<Order, DescriptorError> {
    let content = fs::read_to_string(path)?;
    parse_order_str(&content)
}
