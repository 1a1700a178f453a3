//! The build-metadata label written by the lifecycle exporter and consumed by rebase.

use crate::image::Image;
use crate::reference::ImageRef;
use crate::types::DiffId;
use crate::ImageError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::{debug, warn};

/// Label holding [`LayersMetadata`] as JSON.
pub const METADATA_LABEL: &str = "io.buildpacks.lifecycle.metadata";
/// Label holding the stack id of an image.
pub const STACK_ID_LABEL: &str = "io.buildpacks.stack.id";
/// Label holding the stack mixins of an image as a JSON array.
pub const MIXINS_LABEL: &str = "io.buildpacks.stack.mixins";

/// Build metadata recorded on an app image.
///
/// Only the fields rebase needs are typed; everything else is kept in `extra`
/// and written back unchanged.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LayersMetadata {
    #[serde(default)]
    pub run_image: RunImageMetadata,
    #[serde(default)]
    pub stack: StackMetadata,
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

/// The base image the app image was last built or rebased on.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunImageMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_layer: Option<DiffId>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub reference: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StackMetadata {
    #[serde(default)]
    pub run_image: StackRunImage,
}

impl StackMetadata {
    /// See [`best_run_image_mirror`].
    pub fn best_run_image_mirror(&self, registry: &str) -> Option<String> {
        best_run_image_mirror(self, registry)
    }
}

/// Preferred run image and its mirrors, as declared by the stack.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StackRunImage {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub image: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub mirrors: Vec<String>,
}

impl LayersMetadata {
    /// Decode the metadata label of `image`.
    pub fn from_image(image: &Image) -> Result<Self, ImageError> {
        let raw = image
            .label(METADATA_LABEL)
            .ok_or_else(|| ImageError::MissingLabel(METADATA_LABEL.to_owned()))?;
        decode_label(METADATA_LABEL, raw)
    }

    pub fn to_label(&self) -> Result<String, ImageError> {
        serde_json::to_string(self).map_err(|e| ImageError::Serialization(e.to_string()))
    }

    /// Number of leading layers of `image` that belong to the base image.
    ///
    /// Fails if the top layer is not recorded, is not one of the image's layers,
    /// or occurs more than once so the base/app boundary is ambiguous.
    pub fn base_layer_count(&self, image: &Image) -> Result<usize, ImageError> {
        let decode_err = |reason: String| ImageError::LabelDecode {
            label: METADATA_LABEL.to_owned(),
            reason,
        };
        let top = self
            .run_image
            .top_layer
            .as_ref()
            .ok_or_else(|| decode_err("runImage.topLayer is not set".to_owned()))?;
        let positions: Vec<usize> = image
            .layers()
            .iter()
            .enumerate()
            .filter(|(_, l)| &l.diff_id == top)
            .map(|(i, _)| i)
            .collect();
        match positions.as_slice() {
            [] => Err(decode_err(format!(
                "runImage.topLayer {top} is not a layer of the image"
            ))),
            [i] => Ok(i + 1),
            many => Err(decode_err(format!(
                "runImage.topLayer {top} appears {} times in the image",
                many.len()
            ))),
        }
    }
}

/// Decode a JSON label value into `T`.
pub fn decode_label<T: serde::de::DeserializeOwned>(
    label: &str,
    raw: &str,
) -> Result<T, ImageError> {
    serde_json::from_str(raw).map_err(|e| ImageError::LabelDecode {
        label: label.to_owned(),
        reason: e.to_string(),
    })
}

/// Mixins an image declares through [`MIXINS_LABEL`]; empty when the label is absent.
pub fn image_mixins(image: &Image) -> Result<Vec<String>, ImageError> {
    match image.label(MIXINS_LABEL) {
        Some(raw) => decode_label(MIXINS_LABEL, raw),
        None => Ok(Vec::new()),
    }
}

/// Pick the run image to rebase onto for an app living on `registry`.
///
/// Candidates are the stack's run image followed by its mirrors; the first one
/// on `registry` wins, otherwise the run image itself. Returns `None` when the
/// metadata names no run image.
pub fn best_run_image_mirror(stack: &StackMetadata, registry: &str) -> Option<String> {
    let run_image = &stack.run_image;
    if run_image.image.is_empty() {
        return None;
    }
    let candidates = std::iter::once(&run_image.image).chain(&run_image.mirrors);
    for candidate in candidates {
        match ImageRef::parse(candidate) {
            Ok(r) if r.registry() == registry => {
                debug!("selected run image {candidate} for registry {registry}");
                return Some(candidate.clone());
            }
            Ok(_) => {}
            Err(e) => warn!("skipping unparsable run image mirror: {e}"),
        }
    }
    Some(run_image.image.clone())
}
