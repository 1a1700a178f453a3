//! In-memory image handle: ordered layers plus an OCI image config.
//!
//! Unknown config and manifest fields are carried through untouched so that an
//! image read from one store can be written to another without losing data.

use crate::types::{DiffId, Digest};
use crate::ImageError;
use serde::de::Deserializer;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

pub const OCI_MANIFEST_MEDIA_TYPE: &str = "application/vnd.oci.image.manifest.v1+json";
pub const OCI_CONFIG_MEDIA_TYPE: &str = "application/vnd.oci.image.config.v1+json";
pub const OCI_LAYER_MEDIA_TYPE: &str = "application/vnd.oci.image.layer.v1.tar";
pub const DOCKER_MANIFEST_MEDIA_TYPE: &str =
    "application/vnd.docker.distribution.manifest.v2+json";
pub const DOCKER_CONFIG_MEDIA_TYPE: &str = "application/vnd.docker.container.image.v1+json";

/// Manifest media types this crate can read, in order of preference.
pub const ACCEPTED_MANIFEST_TYPES: [&str; 2] = [OCI_MANIFEST_MEDIA_TYPE, DOCKER_MANIFEST_MEDIA_TYPE];

fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

fn is_false(v: &bool) -> bool {
    !*v
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ImageConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created: Option<String>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub architecture: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub os: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub config: ContainerConfig,
    #[serde(default)]
    pub rootfs: RootFs,
    #[serde(default, deserialize_with = "null_as_default", skip_serializing_if = "Vec::is_empty")]
    pub history: Vec<History>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ContainerConfig {
    #[serde(
        rename = "Labels",
        default,
        deserialize_with = "null_as_default",
        skip_serializing_if = "BTreeMap::is_empty"
    )]
    pub labels: BTreeMap<String, String>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RootFs {
    #[serde(rename = "type", default = "default_rootfs_type")]
    pub kind: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub diff_ids: Vec<DiffId>,
}

impl Default for RootFs {
    fn default() -> Self {
        Self {
            kind: default_rootfs_type(),
            diff_ids: Vec::new(),
        }
    }
}

fn default_rootfs_type() -> String {
    "layers".to_owned()
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct History {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_by: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub author: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
    #[serde(default, skip_serializing_if = "is_false")]
    pub empty_layer: bool,
}

/// Content descriptor as it appears in a manifest.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BlobDescriptor {
    pub media_type: String,
    pub digest: Digest,
    pub size: u64,
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Manifest {
    pub schema_version: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub media_type: Option<String>,
    pub config: BlobDescriptor,
    #[serde(default)]
    pub layers: Vec<BlobDescriptor>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

impl Manifest {
    pub fn from_bytes(data: &[u8]) -> Result<Self, ImageError> {
        serde_json::from_slice(data)
            .map_err(|e| ImageError::Serialization(format!("invalid manifest: {e}")))
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, ImageError> {
        serde_json::to_vec(self).map_err(|e| ImageError::Serialization(e.to_string()))
    }
}

/// One filesystem layer of an image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Layer {
    pub digest: Digest,
    pub diff_id: DiffId,
    pub size: u64,
    pub media_type: String,
    /// Repository the blob can be fetched or mounted from, when it came from a registry.
    pub source: Option<String>,
}

/// A container image: the layer list and config, plus the name it was opened as.
///
/// `layers` and the config's `rootfs.diff_ids` are index-aligned; the config
/// written out by [`Image::config_bytes`] always reflects the current layers.
#[derive(Debug, Clone, PartialEq)]
pub struct Image {
    name: String,
    digest: Option<Digest>,
    manifest_media_type: String,
    layers: Vec<Layer>,
    config: ImageConfig,
}

impl Image {
    pub fn new(name: impl Into<String>, config: ImageConfig, layers: Vec<Layer>) -> Self {
        let mut image = Self {
            name: name.into(),
            digest: None,
            manifest_media_type: OCI_MANIFEST_MEDIA_TYPE.to_owned(),
            layers: Vec::new(),
            config,
        };
        image.set_layers(layers);
        image
    }

    /// Assemble an image from a decoded manifest and raw config bytes.
    pub fn from_parts(
        name: &str,
        manifest: &Manifest,
        config_bytes: &[u8],
        source: Option<&str>,
    ) -> Result<Self, ImageError> {
        let config: ImageConfig = serde_json::from_slice(config_bytes)
            .map_err(|e| ImageError::Serialization(format!("invalid image config: {e}")))?;
        if manifest.layers.len() != config.rootfs.diff_ids.len() {
            return Err(ImageError::Serialization(format!(
                "manifest lists {} layers but config lists {} diff ids",
                manifest.layers.len(),
                config.rootfs.diff_ids.len()
            )));
        }
        let layers = manifest
            .layers
            .iter()
            .zip(&config.rootfs.diff_ids)
            .map(|(desc, diff_id)| Layer {
                digest: desc.digest.clone(),
                diff_id: diff_id.clone(),
                size: desc.size,
                media_type: desc.media_type.clone(),
                source: source.map(str::to_owned),
            })
            .collect();
        Ok(Self {
            name: name.to_owned(),
            digest: None,
            manifest_media_type: manifest
                .media_type
                .clone()
                .unwrap_or_else(|| OCI_MANIFEST_MEDIA_TYPE.to_owned()),
            layers,
            config,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Manifest digest the image was read from, if it came from a store.
    pub fn digest(&self) -> Option<&Digest> {
        self.digest.as_ref()
    }

    #[must_use]
    pub fn with_digest(mut self, digest: Digest) -> Self {
        self.digest = Some(digest);
        self
    }

    pub fn layers(&self) -> &[Layer] {
        &self.layers
    }

    pub fn diff_ids(&self) -> Vec<DiffId> {
        self.layers.iter().map(|l| l.diff_id.clone()).collect()
    }

    pub fn top_layer(&self) -> Option<&DiffId> {
        self.layers.last().map(|l| &l.diff_id)
    }

    pub fn set_layers(&mut self, layers: Vec<Layer>) {
        self.config.rootfs.diff_ids = layers.iter().map(|l| l.diff_id.clone()).collect();
        self.layers = layers;
    }

    pub fn config(&self) -> &ImageConfig {
        &self.config
    }

    pub fn history(&self) -> &[History] {
        &self.config.history
    }

    pub fn set_history(&mut self, history: Vec<History>) {
        self.config.history = history;
    }

    pub fn labels(&self) -> &BTreeMap<String, String> {
        &self.config.config.labels
    }

    pub fn label(&self, key: &str) -> Option<&str> {
        self.config.config.labels.get(key).map(String::as_str)
    }

    pub fn set_label(&mut self, key: &str, value: impl Into<String>) {
        self.config.config.labels.insert(key.to_owned(), value.into());
    }

    pub fn remove_label(&mut self, key: &str) -> Option<String> {
        self.config.config.labels.remove(key)
    }

    pub fn config_bytes(&self) -> Result<Vec<u8>, ImageError> {
        serde_json::to_vec(&self.config).map_err(|e| ImageError::Serialization(e.to_string()))
    }

    /// Manifest for this image whose config blob is `config_bytes`.
    pub fn manifest(&self, config_bytes: &[u8]) -> Manifest {
        let config_media_type = if self.manifest_media_type == DOCKER_MANIFEST_MEDIA_TYPE {
            DOCKER_CONFIG_MEDIA_TYPE
        } else {
            OCI_CONFIG_MEDIA_TYPE
        };
        Manifest {
            schema_version: 2,
            media_type: Some(self.manifest_media_type.clone()),
            config: BlobDescriptor {
                media_type: config_media_type.to_owned(),
                digest: Digest::of(config_bytes),
                size: config_bytes.len() as u64,
                extra: BTreeMap::new(),
            },
            layers: self
                .layers
                .iter()
                .map(|l| BlobDescriptor {
                    media_type: l.media_type.clone(),
                    digest: l.digest.clone(),
                    size: l.size,
                    extra: BTreeMap::new(),
                })
                .collect(),
            extra: BTreeMap::new(),
        }
    }

    pub fn manifest_media_type(&self) -> &str {
        &self.manifest_media_type
    }
}
