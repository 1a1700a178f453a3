//! Platform API versions: capability switches and exit codes.
//!
//! Each supported API is a [`PlatformLayer`] answering only what it changes;
//! a [`Platform`] chains a layer to the platform it extends and walks the chain
//! most-specific first.

use serde::Serialize;
use std::fmt;
use thiserror::Error;

pub const DEFAULT_PLATFORM_API: &str = "0.6";
pub const SUPPORTED_PLATFORM_APIS: [&str; 3] = ["0.3", "0.6", "0.7"];

/// Exit code used when no platform layer answers.
pub const CODE_FAILED: u8 = 1;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PlatformError {
    #[error(
        "platform API '{0}' is not supported (supported: {supported})",
        supported = SUPPORTED_PLATFORM_APIS.join(", ")
    )]
    Unsupported(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Capability {
    AssetPackages,
    MixinValidation,
    GroupHomepage,
}

impl Capability {
    pub fn as_str(self) -> &'static str {
        match self {
            Capability::AssetPackages => "asset-packages",
            Capability::MixinValidation => "mixin-validation",
            Capability::GroupHomepage => "group-homepage",
        }
    }

    pub fn all() -> [Capability; 3] {
        [
            Capability::AssetPackages,
            Capability::MixinValidation,
            Capability::GroupHomepage,
        ]
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ExitKind {
    Failed,
    InvalidArgs,
    FailedSave,
    RebaseError,
}

impl ExitKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ExitKind::Failed => "failed",
            ExitKind::InvalidArgs => "invalid-args",
            ExitKind::FailedSave => "failed-save",
            ExitKind::RebaseError => "rebase-error",
        }
    }
}

impl fmt::Display for ExitKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What one platform API version declares on top of the version it extends.
#[derive(Debug, Clone, Copy)]
pub struct PlatformLayer {
    api: &'static str,
    capabilities: &'static [(Capability, bool)],
    exit_codes: &'static [(ExitKind, u8)],
}

impl PlatformLayer {
    pub fn capability(&self, capability: Capability) -> Option<bool> {
        self.capabilities
            .iter()
            .find(|(c, _)| *c == capability)
            .map(|(_, on)| *on)
    }

    pub fn code(&self, kind: ExitKind) -> Option<u8> {
        self.exit_codes
            .iter()
            .find(|(k, _)| *k == kind)
            .map(|(_, code)| *code)
    }
}

const LEGACY: PlatformLayer = PlatformLayer {
    api: "0.3",
    capabilities: &[],
    exit_codes: &[
        (ExitKind::Failed, 1),
        (ExitKind::InvalidArgs, 3),
        (ExitKind::FailedSave, 10),
        (ExitKind::RebaseError, 1),
    ],
};

const V06: PlatformLayer = PlatformLayer {
    api: "0.6",
    capabilities: &[
        (Capability::AssetPackages, false),
        (Capability::MixinValidation, false),
    ],
    exit_codes: &[],
};

const V07: PlatformLayer = PlatformLayer {
    api: "0.7",
    capabilities: &[
        (Capability::AssetPackages, true),
        (Capability::MixinValidation, true),
        (Capability::GroupHomepage, true),
    ],
    exit_codes: &[(ExitKind::RebaseError, 72)],
};

/// A platform API version together with the version it extends.
#[derive(Debug, Clone)]
pub struct Platform {
    layer: PlatformLayer,
    previous: Option<Box<Platform>>,
}

impl Platform {
    fn extend(layer: PlatformLayer, previous: Platform) -> Self {
        Self {
            layer,
            previous: Some(Box::new(previous)),
        }
    }

    pub fn legacy() -> Self {
        Self {
            layer: LEGACY,
            previous: None,
        }
    }

    pub fn v06() -> Self {
        Self::extend(V06, Self::legacy())
    }

    pub fn v07() -> Self {
        Self::extend(V07, Self::v06())
    }

    pub fn for_api(api: &str) -> Result<Self, PlatformError> {
        match api.trim() {
            "0.3" => Ok(Self::legacy()),
            "0.6" => Ok(Self::v06()),
            "0.7" => Ok(Self::v07()),
            other => Err(PlatformError::Unsupported(other.to_owned())),
        }
    }

    pub fn api(&self) -> &'static str {
        self.layer.api
    }

    pub fn previous(&self) -> Option<&Platform> {
        self.previous.as_deref()
    }

    fn chain(&self) -> impl Iterator<Item = &Platform> {
        std::iter::successors(Some(self), |p| p.previous())
    }

    /// Whether the capability is on; unanswered capabilities are off.
    pub fn supports(&self, capability: Capability) -> bool {
        self.chain()
            .find_map(|p| p.layer.capability(capability))
            .unwrap_or(false)
    }

    /// Exit code for `kind`; unanswered kinds use the generic failure code.
    pub fn code_for(&self, kind: ExitKind) -> u8 {
        self.chain()
            .find_map(|p| p.layer.code(kind))
            .or_else(|| self.chain().find_map(|p| p.layer.code(ExitKind::Failed)))
            .unwrap_or(CODE_FAILED)
    }
}

impl Default for Platform {
    fn default() -> Self {
        Self::v06()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn legacy_exit_codes() {
        let p = Platform::legacy();
        assert_eq!(p.code_for(ExitKind::Failed), 1);
        assert_eq!(p.code_for(ExitKind::InvalidArgs), 3);
        assert_eq!(p.code_for(ExitKind::FailedSave), 10);
        assert_eq!(p.code_for(ExitKind::RebaseError), 1);
    }

    #[test]
    fn v06_delegates_codes_and_disables_capabilities() {
        let p = Platform::v06();
        assert_eq!(p.api(), "0.6");
        assert_eq!(p.previous().unwrap().api(), "0.3");
        assert_eq!(p.code_for(ExitKind::InvalidArgs), 3);
        assert!(!p.supports(Capability::AssetPackages));
        assert!(!p.supports(Capability::MixinValidation));
        assert!(!p.supports(Capability::GroupHomepage));
    }

    #[test]
    fn v07_overrides_most_specific_first() {
        let p = Platform::v07();
        assert_eq!(p.code_for(ExitKind::RebaseError), 72);
        assert_eq!(p.code_for(ExitKind::FailedSave), 10);
        for c in Capability::all() {
            assert!(p.supports(c), "{c} should be on");
        }
        assert_eq!(p.chain().map(Platform::api).collect::<Vec<_>>(), vec!["0.7", "0.6", "0.3"]);
    }

    #[test]
    fn unanswered_kind_falls_back_to_generic_failure() {
        let bare = Platform {
            layer: PlatformLayer {
                api: "test",
                capabilities: &[],
                exit_codes: &[],
            },
            previous: None,
        };
        assert_eq!(bare.code_for(ExitKind::FailedSave), CODE_FAILED);
        assert!(!bare.supports(Capability::AssetPackages));
    }

    #[test]
    fn for_api_selection() {
        assert_eq!(Platform::for_api("0.7").unwrap().api(), "0.7");
        assert_eq!(Platform::for_api(DEFAULT_PLATFORM_API).unwrap().api(), "0.6");
        assert_eq!(
            Platform::for_api("9.9").unwrap_err(),
            PlatformError::Unsupported("9.9".to_owned())
        );
        assert_eq!(Platform::default().api(), "0.6");
    }

    #[test]
    fn unsupported_message_lists_supported_apis() {
        let err = Platform::for_api("0.1").unwrap_err();
        assert_eq!(
            err.to_string(),
            "platform API '0.1' is not supported (supported: 0.3, 0.6, 0.7)"
        );
    }

    #[test]
    fn stable_names() {
        assert_eq!(Capability::MixinValidation.to_string(), "mixin-validation");
        assert_eq!(ExitKind::FailedSave.to_string(), "failed-save");
        assert_eq!(
            serde_json::to_string(&Capability::GroupHomepage).unwrap(),
            "\"group-homepage\""
        );
    }
}
