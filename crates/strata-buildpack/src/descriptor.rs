//! `buildpack.toml` descriptors.

use crate::group::Order;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DescriptorError {
    #[error("failed to read buildpack descriptor: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse buildpack descriptor: {0}")]
    ParseToml(#[from] toml::de::Error),
    #[error("buildpack.id must not be empty")]
    EmptyId,
    #[error("buildpack '{0}' has an empty version")]
    EmptyVersion(String),
    #[error("meta-buildpack '{0}' must not declare stacks")]
    MetaWithStacks(String),
}

/// One buildpack's declaration, as read from its `buildpack.toml`.
#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq, Eq)]
pub struct Descriptor {
    #[serde(default)]
    pub api: String,
    pub buildpack: Info,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub order: Option<Order>,
    /// Directory the descriptor was loaded from, if any.
    #[serde(skip)]
    pub dir: PathBuf,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq, Eq)]
pub struct Info {
    #[serde(rename = "clear-env", default, skip_serializing_if = "is_false")]
    pub clear_env: bool,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub homepage: String,
    pub id: String,
    #[serde(default)]
    pub name: String,
    pub version: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub stacks: Vec<Stack>,
}

/// A base OS identity a regular buildpack can run on.
#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq, Eq)]
pub struct Stack {
    pub id: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub mixins: Vec<String>,
}

impl Descriptor {
    /// Meta-buildpacks are defined by an order, even an empty one.
    pub fn is_meta_buildpack(&self) -> bool {
        self.order.is_some()
    }

    pub fn id(&self) -> &str {
        &self.buildpack.id
    }

    pub fn version(&self) -> &str {
        &self.buildpack.version
    }

    /// Stacks declared by a regular buildpack. Always empty for meta-buildpacks.
    pub fn stacks(&self) -> &[Stack] {
        if self.is_meta_buildpack() {
            &[]
        } else {
            &self.buildpack.stacks
        }
    }

    fn validate(&self) -> Result<(), DescriptorError> {
        if self.buildpack.id.trim().is_empty() {
            return Err(DescriptorError::EmptyId);
        }
        if self.buildpack.version.trim().is_empty() {
            return Err(DescriptorError::EmptyVersion(self.buildpack.id.clone()));
        }
        if self.is_meta_buildpack() && !self.buildpack.stacks.is_empty() {
            return Err(DescriptorError::MetaWithStacks(self.buildpack.id.clone()));
        }
        Ok(())
    }
}

impl fmt::Display for Descriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.buildpack.name, self.buildpack.version)
    }
}

fn is_false(v: &bool) -> bool {
    !*v
}

pub fn parse_descriptor_str(input: &str) -> Result<Descriptor, DescriptorError> {
    let descriptor: Descriptor = toml::from_str(input)?;
    descriptor.validate()?;
    Ok(descriptor)
}

pub fn parse_descriptor_file(path: impl AsRef<Path>) -> Result<Descriptor, DescriptorError> {
    let path = path.as_ref();
    let content = fs::read_to_string(path)?;
    let mut descriptor = parse_descriptor_str(&content)?;
    if let Some(dir) = path.parent() {
        descriptor.dir = dir.to_path_buf();
    }
    Ok(descriptor)
}
