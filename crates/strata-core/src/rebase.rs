//! Layer swap: replace the base layers of an app image with a new base.

use crate::platform::{Capability, Platform};
use crate::RebaseError;
use strata_image::image::History;
use strata_image::metadata::{image_mixins, MIXINS_LABEL, STACK_ID_LABEL};
use strata_image::{DiffId, Image, ImageRef, LayersMetadata, METADATA_LABEL};
use tracing::{debug, warn};

/// A rebased image and what changed underneath it.
#[derive(Debug, Clone)]
pub struct RebasedImage {
    pub image: Image,
    /// Base layers removed from the app image.
    pub replaced_layers: usize,
    /// Base layers taken from the new base.
    pub base_layers: usize,
    /// Layers carried over from the app image.
    pub app_layers: usize,
    pub previous_top_layer: DiffId,
    pub new_top_layer: DiffId,
    /// Reference recorded in the metadata label for the new base.
    pub base_reference: String,
}

/// An app image with its build metadata decoded and its base layers counted.
#[derive(Debug, Clone)]
pub struct AppImage<'a> {
    image: &'a Image,
    metadata: LayersMetadata,
    base_layers: usize,
}

impl<'a> AppImage<'a> {
    /// Decode the metadata label of `image` and locate its base layers.
    pub fn new(image: &'a Image) -> Result<Self, RebaseError> {
        let metadata = LayersMetadata::from_image(image).map_err(RebaseError::MetadataDecode)?;
        let base_layers = metadata
            .base_layer_count(image)
            .map_err(RebaseError::MetadataDecode)?;
        Ok(Self {
            image,
            metadata,
            base_layers,
        })
    }

    pub fn image(&self) -> &'a Image {
        self.image
    }

    pub fn metadata(&self) -> &LayersMetadata {
        &self.metadata
    }

    pub fn base_layers(&self) -> usize {
        self.base_layers
    }
}

/// Put `app`'s non-base layers on top of `new_base`.
///
/// `base_ref` is the reference `new_base` was opened from; it is pinned to the
/// base's manifest digest when one is known. The stack id and mixins labels of
/// the result are those of `new_base`.
pub fn rebase_image(
    app: &AppImage<'_>,
    new_base: &Image,
    base_ref: &str,
    platform: &Platform,
) -> Result<RebasedImage, RebaseError> {
    let base_count = app.base_layers();
    let app_image = app.image();

    check_stack(app_image, new_base)?;
    if platform.supports(Capability::MixinValidation) {
        check_mixins(app_image, new_base)?;
    }

    let new_top = new_base
        .top_layer()
        .cloned()
        .ok_or_else(|| RebaseError::EmptyBase(base_ref.to_owned()))?;
    let previous_top = app_image.layers()[base_count - 1].diff_id.clone();

    let app_layers = &app_image.layers()[base_count..];
    let mut layers = new_base.layers().to_vec();
    layers.extend_from_slice(app_layers);

    let mut image = Image::new(app_image.name(), app_image.config().clone(), layers);
    image.set_history(rebased_history(app_image, new_base, base_count));
    for key in [STACK_ID_LABEL, MIXINS_LABEL] {
        match new_base.label(key) {
            Some(value) => image.set_label(key, value),
            None => {
                image.remove_label(key);
            }
        }
    }

    let base_reference = pinned_reference(new_base, base_ref);
    let mut md = app.metadata().clone();
    md.run_image.top_layer = Some(new_top.clone());
    md.run_image.reference.clone_from(&base_reference);
    image.set_label(METADATA_LABEL, md.to_label()?);

    debug!(
        "replaced {base_count} base layers with {} from {base_ref}",
        new_base.layers().len()
    );
    Ok(RebasedImage {
        image,
        replaced_layers: base_count,
        base_layers: new_base.layers().len(),
        app_layers: app_layers.len(),
        previous_top_layer: previous_top,
        new_top_layer: new_top,
        base_reference,
    })
}

fn pinned_reference(base: &Image, base_ref: &str) -> String {
    match (base.digest(), ImageRef::parse(base_ref)) {
        (Some(digest), Ok(r)) => r.with_digest(digest).to_string(),
        _ => base_ref.to_owned(),
    }
}

/// New base history followed by the app's entries above its old base.
///
/// History entries are matched to layers by skipping `empty_layer` entries.
/// When the app's history does not line up with its layers only the new
/// base history is kept.
fn rebased_history(app: &Image, new_base: &Image, base_count: usize) -> Vec<History> {
    let mut history = new_base.history().to_vec();
    let app_history = app.history();
    let layer_entries = app_history.iter().filter(|h| !h.empty_layer).count();
    if layer_entries != app.layers().len() {
        if !app_history.is_empty() {
            warn!(
                "app history has {layer_entries} layer entries for {} layers; keeping base history only",
                app.layers().len()
            );
        }
        return history;
    }

    let mut seen = 0;
    let split = app_history.iter().position(|h| {
        if !h.empty_layer {
            seen += 1;
        }
        seen == base_count
    });
    if let Some(index) = split {
        history.extend_from_slice(&app_history[index + 1..]);
    }
    history
}

fn check_stack(app: &Image, new_base: &Image) -> Result<(), RebaseError> {
    if let (Some(app_stack), Some(base_stack)) =
        (app.label(STACK_ID_LABEL), new_base.label(STACK_ID_LABEL))
    {
        if app_stack != base_stack {
            return Err(RebaseError::StackMismatch {
                app: app_stack.to_owned(),
                base: base_stack.to_owned(),
            });
        }
    }
    Ok(())
}

/// Mixins that apply at run time, with any `run:` prefix removed.
fn run_mixins(mixins: Vec<String>) -> Vec<String> {
    mixins
        .into_iter()
        .filter(|m| !m.starts_with("build:"))
        .map(|m| m.strip_prefix("run:").map(str::to_owned).unwrap_or(m))
        .collect()
}

fn check_mixins(app: &Image, new_base: &Image) -> Result<(), RebaseError> {
    let required = run_mixins(image_mixins(app).map_err(RebaseError::MetadataDecode)?);
    let provided = run_mixins(image_mixins(new_base)?);
    let missing: Vec<String> = required
        .into_iter()
        .filter(|m| !provided.contains(m))
        .collect();
    if missing.is_empty() {
        Ok(())
    } else {
        Err(RebaseError::MissingMixins(missing))
    }
}
