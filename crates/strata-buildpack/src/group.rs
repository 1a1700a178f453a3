//! Orders, groups, and group buildpack references.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Ranked list of alternative groups; earlier groups are tried first.
pub type Order = Vec<Group>;

/// One candidate set of buildpacks, run together in sequence order.
#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq, Eq)]
pub struct Group {
    #[serde(default)]
    pub group: Vec<GroupBuildpack>,
}

impl Group {
    pub fn new(group: Vec<GroupBuildpack>) -> Self {
        Self { group }
    }

    /// Return a new group holding this group's buildpacks followed by the
    /// buildpacks of each group in `others`, in argument order.
    #[must_use]
    pub fn append(&self, others: &[Group]) -> Group {
        let extra: usize = others.iter().map(Group::len).sum();
        let mut group = Vec::with_capacity(self.group.len() + extra);
        group.extend(self.group.iter().cloned());
        for other in others {
            group.extend(other.group.iter().cloned());
        }
        Group { group }
    }

    pub fn len(&self) -> usize {
        self.group.len()
    }

    pub fn is_empty(&self) -> bool {
        self.group.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, GroupBuildpack> {
        self.group.iter()
    }

    /// Whether a buildpack with the same `(id, version)` is already present.
    pub fn contains(&self, bp: &GroupBuildpack) -> bool {
        self.group.iter().any(|existing| existing.same_buildpack(bp))
    }

    /// Group as recorded for comparison and caching: optional flags, declared
    /// APIs, and homepages removed.
    #[must_use]
    pub fn normalized(&self) -> Group {
        Group {
            group: self
                .group
                .iter()
                .map(|bp| bp.no_opt().no_api().no_homepage())
                .collect(),
        }
    }
}

impl From<GroupBuildpack> for Group {
    fn from(bp: GroupBuildpack) -> Self {
        Self { group: vec![bp] }
    }
}

impl fmt::Display for Group {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, bp) in self.group.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            if bp.optional {
                write!(f, "{bp} (optional)")?;
            } else {
                write!(f, "{bp}")?;
            }
        }
        Ok(())
    }
}

/// A reference to a buildpack inside a group. It may point at a regular
/// buildpack or at a meta-buildpack.
///
/// Identity is `(id, version)`; the remaining fields are presentation and
/// compatibility metadata.
#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq, Eq)]
pub struct GroupBuildpack {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub api: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub homepage: String,
    pub id: String,
    #[serde(default, skip_serializing_if = "is_false")]
    pub optional: bool,
    #[serde(default)]
    pub version: String,
}

fn is_false(v: &bool) -> bool {
    !*v
}

impl GroupBuildpack {
    pub fn new(id: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            version: version.into(),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn optional(mut self) -> Self {
        self.optional = true;
        self
    }

    pub fn same_buildpack(&self, other: &GroupBuildpack) -> bool {
        self.id == other.id && self.version == other.version
    }

    #[must_use]
    pub fn no_opt(&self) -> GroupBuildpack {
        GroupBuildpack {
            optional: false,
            ..self.clone()
        }
    }

    #[must_use]
    pub fn no_api(&self) -> GroupBuildpack {
        GroupBuildpack {
            api: String::new(),
            ..self.clone()
        }
    }

    #[must_use]
    pub fn no_homepage(&self) -> GroupBuildpack {
        GroupBuildpack {
            homepage: String::new(),
            ..self.clone()
        }
    }
}

impl fmt::Display for GroupBuildpack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.id, self.version)
    }
}
