//! Rebase engine for buildpack-built app images.
//!
//! This crate swaps the base (run) image layers under an app image, checks the
//! new base is compatible with the app, saves the result under every requested
//! name, and maps failures onto the platform API's exit codes.

pub mod engine;
pub mod platform;
pub mod rebase;

pub use engine::{RebaseReport, RebaseRequest, Rebaser, ReportError, SavedImage};
pub use platform::{Capability, ExitKind, Platform, PlatformError, DEFAULT_PLATFORM_API};
pub use rebase::{rebase_image, AppImage, RebasedImage};
pub use strata_image::Target;

use std::fmt;
use strata_image::ImageError;
use thiserror::Error;

/// Which image of a rebase an access failure concerns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageRole {
    App,
    Base,
}

impl fmt::Display for ImageRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ImageRole::App => f.write_str("app"),
            ImageRole::Base => f.write_str("run"),
        }
    }
}

/// Broad category of a [`RebaseError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    InvalidArgs,
    ImageAccess,
    MetadataDecode,
    Save,
    Failed,
}

impl ErrorKind {
    /// Exit category the platform maps to a process exit code.
    pub fn exit_kind(self) -> ExitKind {
        match self {
            ErrorKind::InvalidArgs => ExitKind::InvalidArgs,
            ErrorKind::Save => ExitKind::FailedSave,
            ErrorKind::ImageAccess | ErrorKind::MetadataDecode => ExitKind::Failed,
            ErrorKind::Failed => ExitKind::RebaseError,
        }
    }
}

/// Outcome of saving a rebased image under several names.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SaveFailure {
    /// Names that could not be written, each with the reason.
    pub failed: Vec<(String, String)>,
    /// Names that were written.
    pub saved: Vec<String>,
}

impl fmt::Display for SaveFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("failed to write image to the following tags: ")?;
        for (i, (name, reason)) in self.failed.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "[{name}: {reason}]")?;
        }
        Ok(())
    }
}

#[derive(Debug, Error)]
pub enum RebaseError {
    #[error("invalid arguments: {0}")]
    InvalidArgs(String),
    #[error("failed to access {role} image '{reference}': {source}")]
    ImageAccess {
        role: ImageRole,
        reference: String,
        #[source]
        source: ImageError,
    },
    #[error("failed to read build metadata: {0}")]
    MetadataDecode(#[source] ImageError),
    #[error("{0}")]
    Save(SaveFailure),
    #[error("incompatible stack: app image has stack '{app}', new run image has '{base}'")]
    StackMismatch { app: String, base: String },
    #[error("new run image is missing required mixins: {}", .0.join(", "))]
    MissingMixins(Vec<String>),
    #[error("new run image '{0}' has no layers")]
    EmptyBase(String),
    #[error("image error: {0}")]
    Image(#[from] ImageError),
}

impl RebaseError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            RebaseError::InvalidArgs(_) => ErrorKind::InvalidArgs,
            RebaseError::ImageAccess { .. } => ErrorKind::ImageAccess,
            RebaseError::MetadataDecode(_) => ErrorKind::MetadataDecode,
            RebaseError::Save(_) => ErrorKind::Save,
            RebaseError::StackMismatch { .. }
            | RebaseError::MissingMixins(_)
            | RebaseError::EmptyBase(_)
            | RebaseError::Image(_) => ErrorKind::Failed,
        }
    }

    /// Process exit code for this error under `platform`.
    pub fn exit_code(&self, platform: &Platform) -> u8 {
        platform.code_for(self.kind().exit_kind())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn save_failure_lists_every_failed_name() {
        let err = RebaseError::Save(SaveFailure {
            failed: vec![
                ("a:1".to_owned(), "denied".to_owned()),
                ("a:2".to_owned(), "timeout".to_owned()),
            ],
            saved: vec!["a:0".to_owned()],
        });
        assert_eq!(
            err.to_string(),
            "failed to write image to the following tags: [a:1: denied], [a:2: timeout]"
        );
        assert_eq!(err.kind(), ErrorKind::Save);
    }

    #[test]
    fn kinds_map_to_platform_codes() {
        let legacy = Platform::legacy();
        let v07 = Platform::v07();
        let invalid = RebaseError::InvalidArgs("no images".to_owned());
        assert_eq!(invalid.exit_code(&legacy), 3);

        let save = RebaseError::Save(SaveFailure::default());
        assert_eq!(save.exit_code(&v07), 10);

        let mismatch = RebaseError::StackMismatch {
            app: "a".to_owned(),
            base: "b".to_owned(),
        };
        assert_eq!(mismatch.exit_code(&legacy), 1);
        assert_eq!(mismatch.exit_code(&v07), 72);

        let access = RebaseError::ImageAccess {
            role: ImageRole::Base,
            reference: "run".to_owned(),
            source: ImageError::NotFound("run".to_owned()),
        };
        assert_eq!(access.kind(), ErrorKind::ImageAccess);
        assert_eq!(access.exit_code(&v07), 1);
        assert!(access.to_string().starts_with("failed to access run image 'run'"));
    }
}
