//! On-disk image store used for the daemon target.
//!
//! Layout under the root:
//!
//! ```text
//! blobs/sha256/<hex>   layer, config and manifest blobs
//! refs/<name>          manifest digest for an image name
//! lock                 advisory lock taken while saving
//! ```

use crate::image::{Image, Layer, Manifest, OCI_LAYER_MEDIA_TYPE};
use crate::reference::ImageRef;
use crate::types::{DiffId, Digest};
use crate::{ImageError, ImageStore};
use fs2::FileExt;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use tracing::{debug, info};

pub struct LocalStore {
    root: PathBuf,
}

impl LocalStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn blobs_dir(&self) -> PathBuf {
        self.root.join("blobs").join("sha256")
    }

    fn refs_dir(&self) -> PathBuf {
        self.root.join("refs")
    }

    fn lock_file(&self) -> PathBuf {
        self.root.join("lock")
    }

    fn blob_path(&self, digest: &Digest) -> PathBuf {
        self.blobs_dir().join(digest.hex())
    }

    pub fn initialize(&self) -> Result<(), ImageError> {
        fs::create_dir_all(self.blobs_dir())?;
        fs::create_dir_all(self.refs_dir())?;
        Ok(())
    }

    /// Store a blob and return its digest. Existing blobs are left as they are.
    pub fn put_blob(&self, data: &[u8]) -> Result<Digest, ImageError> {
        let digest = Digest::of(data);
        let dest = self.blob_path(&digest);
        if dest.exists() {
            return Ok(digest);
        }
        atomic_write(&self.blobs_dir(), &dest, data)?;
        Ok(digest)
    }

    /// Read a blob, verifying its content against `digest`.
    pub fn get_blob(&self, digest: &Digest) -> Result<Vec<u8>, ImageError> {
        if !digest.is_sha256() {
            return Err(ImageError::NotFound(format!("blob {digest}")));
        }
        let path = self.blob_path(digest);
        if !path.exists() {
            return Err(ImageError::NotFound(format!("blob {digest}")));
        }
        let data = fs::read(&path)?;
        let actual = Digest::of(&data);
        if &actual != digest {
            return Err(ImageError::IntegrityFailure {
                key: digest.to_string(),
                expected: digest.to_string(),
                actual: actual.into_inner(),
            });
        }
        Ok(data)
    }

    pub fn has_blob(&self, digest: &Digest) -> bool {
        digest.is_sha256() && self.blob_path(digest).exists()
    }

    /// Store uncompressed layer content and describe it as a layer.
    pub fn put_layer(&self, data: &[u8]) -> Result<Layer, ImageError> {
        let digest = self.put_blob(data)?;
        Ok(Layer {
            diff_id: DiffId::new(digest.as_str()),
            digest,
            size: data.len() as u64,
            media_type: OCI_LAYER_MEDIA_TYPE.to_owned(),
            source: None,
        })
    }

    fn ref_path(&self, name: &str) -> Result<PathBuf, ImageError> {
        let canonical = ImageRef::parse(name)?.to_string();
        Ok(self.refs_dir().join(escape_ref(&canonical)))
    }

    /// Manifest digest recorded for `name`, if any.
    pub fn resolve(&self, name: &str) -> Result<Option<Digest>, ImageError> {
        let path = self.ref_path(name)?;
        if !path.exists() {
            return Ok(None);
        }
        let content = fs::read_to_string(&path)?;
        Ok(Some(Digest::new(content.trim())))
    }
}

impl ImageStore for LocalStore {
    fn open(&self, reference: &str) -> Result<Image, ImageError> {
        let manifest_digest = self
            .resolve(reference)?
            .ok_or_else(|| ImageError::NotFound(reference.to_owned()))?;
        let manifest = Manifest::from_bytes(&self.get_blob(&manifest_digest)?)?;
        let config = self.get_blob(&manifest.config.digest)?;
        debug!("opened {reference} as {manifest_digest}");
        Ok(Image::from_parts(reference, &manifest, &config, None)?.with_digest(manifest_digest))
    }

    fn save(&self, image: &Image, name: &str) -> Result<Digest, ImageError> {
        let ref_path = self.ref_path(name)?;
        self.initialize()?;
        let _lock = StoreLock::acquire(&self.lock_file())?;

        for layer in image.layers() {
            if !self.has_blob(&layer.digest) {
                return Err(ImageError::MissingBlob(layer.digest.to_string()));
            }
        }

        let config = image.config_bytes()?;
        self.put_blob(&config)?;
        let manifest = image.manifest(&config).to_bytes()?;
        let digest = self.put_blob(&manifest)?;

        atomic_write(&self.refs_dir(), &ref_path, digest.as_bytes())?;
        info!("saved {name} as {digest}");
        Ok(digest)
    }
}

fn escape_ref(name: &str) -> String {
    name.replace('%', "%25")
        .replace('/', "%2F")
        .replace(':', "%3A")
        .replace('@', "%40")
}

fn atomic_write(dir: &Path, dest: &Path, data: &[u8]) -> Result<(), ImageError> {
    let mut tmp = NamedTempFile::new_in(dir)?;
    tmp.write_all(data)?;
    tmp.as_file().sync_all()?;
    tmp.persist(dest).map_err(|e| ImageError::Io(e.error))?;
    fsync_dir(dir)?;
    Ok(())
}

/// Make a rename inside `dir` durable.
fn fsync_dir(dir: &Path) -> Result<(), std::io::Error> {
    File::open(dir)?.sync_all()
}

struct StoreLock {
    file: File,
}

impl StoreLock {
    fn acquire(path: &Path) -> Result<Self, ImageError> {
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(path)?;
        file.lock_exclusive()
            .map_err(|e| ImageError::Lock(format!("{}: {e}", path.display())))?;
        Ok(Self { file })
    }
}

impl Drop for StoreLock {
    fn drop(&mut self) {
        let _ = self.file.unlock();
    }
}
