//! Image reference parsing: `[registry/]repository[:tag][@digest]`.

use crate::ImageError;
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

pub const DEFAULT_REGISTRY: &str = "index.docker.io";
pub const DEFAULT_TAG: &str = "latest";

/// A parsed image reference with Docker Hub defaults applied.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ImageRef {
    registry: String,
    repository: String,
    tag: Option<String>,
    digest: Option<String>,
}

impl ImageRef {
    pub fn parse(input: &str) -> Result<Self, ImageError> {
        let invalid = |reason: &str| ImageError::InvalidReference {
            reference: input.to_owned(),
            reason: reason.to_owned(),
        };

        if input.is_empty() {
            return Err(invalid("empty reference"));
        }
        if input.trim() != input {
            return Err(invalid("surrounding whitespace"));
        }

        let (name, digest) = match input.split_once('@') {
            Some((name, digest)) => {
                let valid = digest.split_once(':').is_some_and(|(algo, hex)| {
                    !algo.is_empty() && !hex.is_empty() && hex.bytes().all(|b| b.is_ascii_hexdigit())
                });
                if !valid {
                    return Err(invalid("malformed digest"));
                }
                (name, Some(digest.to_owned()))
            }
            None => (input, None),
        };

        let (registry, remainder) = match name.split_once('/') {
            Some((first, rest))
                if first.contains('.') || first.contains(':') || first == "localhost" =>
            {
                (normalize_registry(first), rest)
            }
            _ => (DEFAULT_REGISTRY.to_owned(), name),
        };

        let last_slash = remainder.rfind('/').map_or(0, |i| i + 1);
        let (repository, tag) = match remainder[last_slash..].rfind(':') {
            Some(i) => {
                let split = last_slash + i;
                (&remainder[..split], Some(&remainder[split + 1..]))
            }
            None => (remainder, None),
        };

        if let Some(tag) = tag {
            let valid = !tag.is_empty()
                && tag.len() <= 128
                && tag
                    .bytes()
                    .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'_' | b'.' | b'-'));
            if !valid {
                return Err(invalid("malformed tag"));
            }
        }

        if repository.is_empty() || repository.split('/').any(str::is_empty) {
            return Err(invalid("empty repository path component"));
        }
        if !repository.bytes().all(|b| {
            b.is_ascii_lowercase() || b.is_ascii_digit() || matches!(b, b'.' | b'_' | b'-' | b'/')
        }) {
            return Err(invalid("repository must be lowercase alphanumerics and separators"));
        }

        let repository = if registry == DEFAULT_REGISTRY && !repository.contains('/') {
            format!("library/{repository}")
        } else {
            repository.to_owned()
        };

        Ok(Self {
            registry,
            repository,
            tag: tag.map(str::to_owned),
            digest,
        })
    }

    /// Registry host, with `docker.io` normalized to [`DEFAULT_REGISTRY`].
    pub fn registry(&self) -> &str {
        &self.registry
    }

    pub fn repository(&self) -> &str {
        &self.repository
    }

    pub fn tag(&self) -> Option<&str> {
        self.tag.as_deref()
    }

    pub fn digest(&self) -> Option<&str> {
        self.digest.as_deref()
    }

    /// What to ask a registry for: the digest if pinned, else the tag.
    pub fn identifier(&self) -> &str {
        self.digest
            .as_deref()
            .or(self.tag.as_deref())
            .unwrap_or(DEFAULT_TAG)
    }

    /// Same repository, pinned to `digest`.
    #[must_use]
    pub fn with_digest(&self, digest: &str) -> Self {
        Self {
            digest: Some(digest.to_owned()),
            tag: None,
            ..self.clone()
        }
    }
}

impl FromStr for ImageRef {
    type Err = ImageError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for ImageRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.registry, self.repository)?;
        match (&self.tag, &self.digest) {
            (_, Some(digest)) => write!(f, "@{digest}"),
            (Some(tag), None) => write!(f, ":{tag}"),
            (None, None) => write!(f, ":{DEFAULT_TAG}"),
        }
    }
}

fn normalize_registry(host: &str) -> String {
    if host == "docker.io" {
        DEFAULT_REGISTRY.to_owned()
    } else {
        host.to_owned()
    }
}

/// Registry host of a reference string.
pub fn registry_of(reference: &str) -> Result<String, ImageError> {
    Ok(ImageRef::parse(reference)?.registry)
}

/// Check that every name lives on one registry and return that registry.
pub fn ensure_single_registry<S: AsRef<str>>(names: &[S]) -> Result<String, ImageError> {
    let mut registries = BTreeSet::new();
    for name in names {
        registries.insert(registry_of(name.as_ref())?);
    }
    let mut iter = registries.into_iter();
    match (iter.next(), iter.next()) {
        (None, _) => Err(ImageError::NoImages),
        (Some(only), None) => Ok(only),
        (Some(first), Some(second)) => {
            let mut all = vec![first, second];
            all.extend(iter);
            Err(ImageError::MultipleRegistries(all))
        }
    }
}
