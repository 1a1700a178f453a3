//! Image references, the OCI image model, and image stores for strata.
//!
//! This crate parses image references, decodes the buildpack build-metadata
//! label, and reads and writes images either in a local content-addressable
//! store (the daemon target) or in an OCI distribution registry.

pub mod auth;
pub mod image;
pub mod local;
pub mod metadata;
pub mod reference;
pub mod registry;
pub mod types;

pub use auth::Keychain;
pub use image::{History, Image, ImageConfig, Layer, Manifest};
pub use local::LocalStore;
pub use metadata::{best_run_image_mirror, LayersMetadata, METADATA_LABEL};
pub use reference::{ensure_single_registry, registry_of, ImageRef};
pub use registry::RegistryClient;
pub use types::{DiffId, Digest};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ImageError {
    #[error("image I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("HTTP error: {0}")]
    Http(String),
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("image not found: {0}")]
    NotFound(String),
    #[error("invalid image reference '{reference}': {reason}")]
    InvalidReference { reference: String, reason: String },
    #[error("images must all be on the same registry, found: {}", .0.join(", "))]
    MultipleRegistries(Vec<String>),
    #[error("at least one image name is required")]
    NoImages,
    #[error("image has no '{0}' label")]
    MissingLabel(String),
    #[error("failed to decode label '{label}': {reason}")]
    LabelDecode { label: String, reason: String },
    #[error("integrity failure for '{key}': expected {expected}, got {actual}")]
    IntegrityFailure {
        key: String,
        expected: String,
        actual: String,
    },
    #[error("layer blob {0} is not available")]
    MissingBlob(String),
    #[error("image store lock error: {0}")]
    Lock(String),
    #[error("registry authentication error: {0}")]
    Auth(String),
}

/// Where images are read from and written to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Target {
    /// The local image store.
    Daemon,
    /// A remote OCI registry.
    Registry,
}

impl std::fmt::Display for Target {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Target::Daemon => f.write_str("daemon"),
            Target::Registry => f.write_str("registry"),
        }
    }
}

/// Backend able to load an image by name and persist an image under a name.
pub trait ImageStore {
    /// Open the image named `reference`. Returns [`ImageError::NotFound`] if absent.
    fn open(&self, reference: &str) -> Result<Image, ImageError>;

    /// Persist `image` under `name`. Returns the manifest digest written.
    fn save(&self, image: &Image, name: &str) -> Result<Digest, ImageError>;
}
