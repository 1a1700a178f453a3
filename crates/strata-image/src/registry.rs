//! OCI distribution client used for the registry target.
//!
//! Speaks the subset of the distribution API needed to read an image and to
//! push a rebased one:
//! - `GET  /v2/<repo>/manifests/<ref>`       - fetch manifest
//! - `GET  /v2/<repo>/blobs/<digest>`        - fetch config or layer blob
//! - `HEAD /v2/<repo>/blobs/<digest>`        - check blob presence
//! - `POST /v2/<repo>/blobs/uploads/`        - start upload, or mount with `?mount=&from=`
//! - `PUT  <location>?digest=<digest>`       - finish a monolithic upload
//! - `PUT  /v2/<repo>/manifests/<ref>`       - push manifest

use crate::auth::Keychain;
use crate::image::{Image, Manifest, ACCEPTED_MANIFEST_TYPES};
use crate::reference::{ImageRef, DEFAULT_REGISTRY};
use crate::types::Digest;
use crate::{ImageError, ImageStore};
use std::io::Read;
use tracing::{debug, info};

const DOCKER_HUB_API_HOST: &str = "registry-1.docker.io";

pub struct RegistryClient {
    agent: ureq::Agent,
    keychain: Keychain,
    insecure: Vec<String>,
}

impl RegistryClient {
    pub fn new(keychain: Keychain) -> Self {
        let agent = ureq::Agent::new_with_defaults();
        Self {
            agent,
            keychain,
            insecure: Vec::new(),
        }
    }

    /// Talk plain HTTP to these registry hosts.
    #[must_use]
    pub fn with_insecure(mut self, hosts: impl IntoIterator<Item = String>) -> Self {
        self.insecure.extend(hosts);
        self
    }

    /// `scheme://host` serving the API for `registry`.
    pub fn base_url(&self, registry: &str) -> String {
        let host = if registry == DEFAULT_REGISTRY {
            DOCKER_HUB_API_HOST
        } else {
            registry
        };
        let hostname = host.split(':').next().unwrap_or(host);
        let plain = hostname == "localhost"
            || hostname == "127.0.0.1"
            || self.insecure.iter().any(|h| h == registry);
        if plain {
            format!("http://{host}")
        } else {
            format!("https://{host}")
        }
    }

    fn authorize<B>(&self, req: ureq::RequestBuilder<B>, registry: &str) -> ureq::RequestBuilder<B> {
        match self.keychain.authorization(registry) {
            Some(value) => req.header("Authorization", value),
            None => req,
        }
    }

    fn get(&self, registry: &str, url: &str, accept: Option<&str>) -> Result<Vec<u8>, ImageError> {
        debug!("GET {url}");
        let mut req = self.authorize(self.agent.get(url), registry);
        if let Some(accept) = accept {
            req = req.header("Accept", accept);
        }
        let resp = req.call().map_err(|e| request_error(url, e))?;
        let mut reader = resp.into_body().into_reader();
        let mut body = Vec::new();
        reader
            .read_to_end(&mut body)
            .map_err(|e| ImageError::Http(e.to_string()))?;
        Ok(body)
    }

    fn get_blob(&self, registry: &str, repo: &str, digest: &Digest) -> Result<Vec<u8>, ImageError> {
        let url = format!("{}/v2/{repo}/blobs/{digest}", self.base_url(registry));
        let data = self.get(registry, &url, None)?;
        let actual = Digest::of(&data);
        if &actual != digest {
            return Err(ImageError::IntegrityFailure {
                key: url,
                expected: digest.to_string(),
                actual: actual.into_inner(),
            });
        }
        Ok(data)
    }

    fn has_blob(&self, registry: &str, repo: &str, digest: &Digest) -> Result<bool, ImageError> {
        let url = format!("{}/v2/{repo}/blobs/{digest}", self.base_url(registry));
        debug!("HEAD {url}");
        match self.authorize(self.agent.head(&url), registry).call() {
            Ok(_) => Ok(true),
            Err(ureq::Error::StatusCode(404)) => Ok(false),
            Err(e) => Err(request_error(&url, e)),
        }
    }

    /// Try to mount `digest` from `from` into `repo`. On failure, returns the
    /// upload location the registry opened instead.
    fn mount_blob(
        &self,
        registry: &str,
        repo: &str,
        from: &str,
        digest: &Digest,
    ) -> Result<Option<String>, ImageError> {
        let base = self.base_url(registry);
        let url = format!("{base}/v2/{repo}/blobs/uploads/?mount={digest}&from={from}");
        debug!("POST {url}");
        let resp = self
            .authorize(self.agent.post(&url), registry)
            .send_empty()
            .map_err(|e| request_error(&url, e))?;
        match resp.status().as_u16() {
            201 => Ok(None),
            202 => location(&base, &resp).map(Some),
            code => Err(ImageError::Http(format!("HTTP {code} for POST {url}"))),
        }
    }

    fn start_upload(&self, registry: &str, repo: &str) -> Result<String, ImageError> {
        let base = self.base_url(registry);
        let url = format!("{base}/v2/{repo}/blobs/uploads/");
        debug!("POST {url}");
        let resp = self
            .authorize(self.agent.post(&url), registry)
            .send_empty()
            .map_err(|e| request_error(&url, e))?;
        location(&base, &resp)
    }

    fn finish_upload(
        &self,
        registry: &str,
        location: &str,
        digest: &Digest,
        data: &[u8],
    ) -> Result<(), ImageError> {
        let sep = if location.contains('?') { '&' } else { '?' };
        let url = format!("{location}{sep}digest={digest}");
        debug!("PUT {url} ({} bytes)", data.len());
        self.authorize(self.agent.put(&url), registry)
            .header("Content-Type", "application/octet-stream")
            .send(data)
            .map_err(|e| request_error(&url, e))?;
        Ok(())
    }

    fn upload_blob(
        &self,
        registry: &str,
        repo: &str,
        digest: &Digest,
        data: &[u8],
    ) -> Result<(), ImageError> {
        let location = self.start_upload(registry, repo)?;
        self.finish_upload(registry, &location, digest, data)
    }

    /// Make a layer blob available in `dest`, mounting it when it already
    /// lives elsewhere on the same registry.
    fn transfer_layer(
        &self,
        dest: &ImageRef,
        digest: &Digest,
        source: Option<&str>,
    ) -> Result<(), ImageError> {
        let registry = dest.registry();
        let repo = dest.repository();
        if self.has_blob(registry, repo, digest)? {
            debug!("{digest} already present in {repo}");
            return Ok(());
        }
        let (src_registry, src_repo) = source
            .and_then(|s| s.split_once('/'))
            .ok_or_else(|| ImageError::MissingBlob(digest.to_string()))?;

        let pending = if src_registry == registry {
            match self.mount_blob(registry, repo, src_repo, digest)? {
                None => {
                    info!("mounted {digest} from {src_repo}");
                    return Ok(());
                }
                Some(location) => Some(location),
            }
        } else {
            None
        };

        let data = self.get_blob(src_registry, src_repo, digest)?;
        match pending {
            Some(location) => self.finish_upload(registry, &location, digest, &data),
            None => self.upload_blob(registry, repo, digest, &data),
        }
    }
}

impl ImageStore for RegistryClient {
    fn open(&self, reference: &str) -> Result<Image, ImageError> {
        let r = ImageRef::parse(reference)?;
        let url = format!(
            "{}/v2/{}/manifests/{}",
            self.base_url(r.registry()),
            r.repository(),
            r.identifier()
        );
        let accept = ACCEPTED_MANIFEST_TYPES.join(", ");
        let body = self.get(r.registry(), &url, Some(accept.as_str()))?;
        let manifest = Manifest::from_bytes(&body)?;
        let config = self.get_blob(r.registry(), r.repository(), &manifest.config.digest)?;
        let source = format!("{}/{}", r.registry(), r.repository());
        debug!("opened {reference} ({} layers)", manifest.layers.len());
        Ok(Image::from_parts(reference, &manifest, &config, Some(&source))?
            .with_digest(Digest::of(&body)))
    }

    fn save(&self, image: &Image, name: &str) -> Result<Digest, ImageError> {
        let dest = ImageRef::parse(name)?;
        let registry = dest.registry();
        let repo = dest.repository();

        for layer in image.layers() {
            self.transfer_layer(&dest, &layer.digest, layer.source.as_deref())?;
        }

        let config = image.config_bytes()?;
        let config_digest = Digest::of(&config);
        if !self.has_blob(registry, repo, &config_digest)? {
            self.upload_blob(registry, repo, &config_digest, &config)?;
        }

        let manifest = image.manifest(&config).to_bytes()?;
        let url = format!(
            "{}/v2/{repo}/manifests/{}",
            self.base_url(registry),
            dest.identifier()
        );
        debug!("PUT {url}");
        self.authorize(self.agent.put(&url), registry)
            .header("Content-Type", image.manifest_media_type())
            .send(&manifest[..])
            .map_err(|e| request_error(&url, e))?;

        let digest = Digest::of(&manifest);
        info!("pushed {name} as {digest}");
        Ok(digest)
    }
}

fn location(base: &str, resp: &ureq::http::Response<ureq::Body>) -> Result<String, ImageError> {
    let value = resp
        .headers()
        .get("Location")
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| ImageError::Http("upload response has no Location header".to_owned()))?;
    if value.starts_with("http://") || value.starts_with("https://") {
        Ok(value.to_owned())
    } else {
        Ok(format!("{base}{value}"))
    }
}

fn request_error(url: &str, e: ureq::Error) -> ImageError {
    match e {
        ureq::Error::StatusCode(404) => ImageError::NotFound(url.to_owned()),
        ureq::Error::StatusCode(code @ (401 | 403)) => {
            ImageError::Auth(format!("HTTP {code} for {url}"))
        }
        ureq::Error::StatusCode(code) => ImageError::Http(format!("HTTP {code} for {url}")),
        other => ImageError::Http(other.to_string()),
    }
}
