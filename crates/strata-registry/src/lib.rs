//! Reference OCI distribution registry (the subset strata uses).
//!
//! Routes:
//! - `GET  /v2/`                                  - API version check
//! - `GET|HEAD /v2/<name>/blobs/<digest>`         - fetch or probe a blob
//! - `POST /v2/<name>/blobs/uploads/[?mount=&from=]` - start an upload or mount a blob
//! - `PUT  /v2/<name>/blobs/uploads/<id>?digest=` - finish a monolithic upload
//! - `GET|HEAD|PUT /v2/<name>/manifests/<ref>`    - manifests by tag or digest
//!
//! Blob content lives once in `{data_dir}/blobs/sha256/<hex>`; each repository
//! keeps links to the blobs it may serve, so cross-repository mounts behave as
//! on a real registry.
//!
//! The [`TestServer`] helper starts a registry on a random port for integration testing.

use sha2::{Digest as _, Sha256};
use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};
use tiny_http::{Header, Method, Response, Server, StatusCode};
use tracing::{debug, error, info};

const OCI_MANIFEST: &str = "application/vnd.oci.image.manifest.v1+json";

/// File-backed blob and manifest store.
pub struct Store {
    data_dir: PathBuf,
    read_only: RwLock<BTreeSet<String>>,
    next_upload: AtomicUsize,
    mounts: AtomicUsize,
    uploads: AtomicUsize,
}

impl Store {
    pub fn new(data_dir: PathBuf) -> Self {
        Self {
            data_dir,
            read_only: RwLock::new(BTreeSet::new()),
            next_upload: AtomicUsize::new(0),
            mounts: AtomicUsize::new(0),
            uploads: AtomicUsize::new(0),
        }
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    fn blob_path(&self, digest: &str) -> Option<PathBuf> {
        let hex = digest.strip_prefix("sha256:")?;
        if hex.len() != 64 || !hex.bytes().all(|b| b.is_ascii_hexdigit()) {
            return None;
        }
        Some(self.data_dir.join("blobs").join("sha256").join(hex))
    }

    fn repo_dir(&self, repo: &str) -> PathBuf {
        self.data_dir.join("repos").join(repo.replace('/', "%2F"))
    }

    fn link_path(&self, repo: &str, digest: &str) -> PathBuf {
        self.repo_dir(repo).join("blobs").join(digest.replace(':', "_"))
    }

    fn tag_path(&self, repo: &str, reference: &str) -> PathBuf {
        self.repo_dir(repo)
            .join("manifests")
            .join(reference.replace(':', "_"))
    }

    /// Store `data` in `repo` after checking it hashes to `digest`.
    pub fn put_blob(&self, repo: &str, digest: &str, data: &[u8]) -> Result<(), String> {
        let actual = sha256_digest(data);
        if actual != digest {
            return Err(format!("digest mismatch: expected {digest}, got {actual}"));
        }
        let path = self.blob_path(digest).ok_or("unsupported digest")?;
        let write = || -> std::io::Result<()> {
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::write(&path, data)?;
            self.link(repo, digest)
        };
        write().map_err(|e| e.to_string())
    }

    fn link(&self, repo: &str, digest: &str) -> std::io::Result<()> {
        let link = self.link_path(repo, digest);
        if let Some(parent) = link.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(link, b"")
    }

    pub fn has_blob(&self, repo: &str, digest: &str) -> bool {
        self.blob_path(digest).is_some_and(|p| p.exists()) && self.link_path(repo, digest).exists()
    }

    pub fn get_blob(&self, repo: &str, digest: &str) -> Option<Vec<u8>> {
        if !self.has_blob(repo, digest) {
            return None;
        }
        fs::read(self.blob_path(digest)?).ok()
    }

    /// Make a blob of `from` available in `repo`. Returns false if `from` lacks it.
    pub fn mount(&self, repo: &str, from: &str, digest: &str) -> bool {
        if !self.has_blob(from, digest) {
            return false;
        }
        if self.link(repo, digest).is_err() {
            return false;
        }
        self.mounts.fetch_add(1, Ordering::SeqCst);
        true
    }

    /// Store a manifest under `reference` (a tag or its digest). Every blob it
    /// names must already be present in `repo`.
    pub fn put_manifest(&self, repo: &str, reference: &str, data: &[u8]) -> Result<String, String> {
        let value: serde_json::Value =
            serde_json::from_slice(data).map_err(|e| format!("invalid manifest: {e}"))?;
        let mut referenced = Vec::new();
        if let Some(d) = value["config"]["digest"].as_str() {
            referenced.push(d);
        }
        if let Some(layers) = value["layers"].as_array() {
            referenced.extend(layers.iter().filter_map(|l| l["digest"].as_str()));
        }
        if let Some(missing) = referenced.iter().find(|d| !self.has_blob(repo, d)) {
            return Err(format!("blob unknown to repository: {missing}"));
        }

        let digest = sha256_digest(data);
        self.put_blob(repo, &digest, data)?;
        let tag = self.tag_path(repo, reference);
        let write = || -> std::io::Result<()> {
            if let Some(parent) = tag.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::write(&tag, digest.as_bytes())
        };
        write().map_err(|e| e.to_string())?;
        Ok(digest)
    }

    /// Manifest bytes and digest for a tag or digest reference.
    pub fn get_manifest(&self, repo: &str, reference: &str) -> Option<(Vec<u8>, String)> {
        let digest = if reference.starts_with("sha256:") {
            reference.to_owned()
        } else {
            fs::read_to_string(self.tag_path(repo, reference)).ok()?
        };
        let data = self.get_blob(repo, &digest)?;
        Some((data, digest))
    }

    /// Reject every write to `repo` with 403.
    pub fn set_read_only(&self, repo: &str) {
        self.read_only
            .write()
            .expect("read-only lock poisoned")
            .insert(repo.to_owned());
    }

    fn is_read_only(&self, repo: &str) -> bool {
        self.read_only
            .read()
            .expect("read-only lock poisoned")
            .contains(repo)
    }

    /// Number of blobs satisfied by cross-repository mounts.
    pub fn mount_count(&self) -> usize {
        self.mounts.load(Ordering::SeqCst)
    }

    /// Number of blob uploads completed with data.
    pub fn upload_count(&self) -> usize {
        self.uploads.load(Ordering::SeqCst)
    }
}

/// `sha256:<hex>` of `data`.
pub fn sha256_digest(data: &[u8]) -> String {
    format!("sha256:{}", hex::encode(Sha256::digest(data)))
}

/// Route of a `/v2/` request path (query already removed).
#[derive(Debug, PartialEq, Eq)]
pub enum Route<'a> {
    Base,
    Blob { repo: &'a str, digest: &'a str },
    StartUpload { repo: &'a str },
    FinishUpload { repo: &'a str, id: &'a str },
    Manifest { repo: &'a str, reference: &'a str },
}

pub fn parse_route(path: &str) -> Option<Route<'_>> {
    let rest = path.strip_prefix("/v2/")?;
    if rest.is_empty() {
        return Some(Route::Base);
    }
    if let Some(idx) = rest.rfind("/manifests/") {
        let (repo, reference) = (&rest[..idx], &rest[idx + "/manifests/".len()..]);
        return (!repo.is_empty() && !reference.is_empty())
            .then_some(Route::Manifest { repo, reference });
    }
    if let Some(idx) = rest.find("/blobs/uploads/") {
        let (repo, id) = (&rest[..idx], &rest[idx + "/blobs/uploads/".len()..]);
        if repo.is_empty() {
            return None;
        }
        return Some(if id.is_empty() {
            Route::StartUpload { repo }
        } else {
            Route::FinishUpload { repo, id }
        });
    }
    if let Some(idx) = rest.rfind("/blobs/") {
        let (repo, digest) = (&rest[..idx], &rest[idx + "/blobs/".len()..]);
        return (!repo.is_empty() && !digest.is_empty()).then_some(Route::Blob { repo, digest });
    }
    None
}

fn query_param<'a>(query: &'a str, key: &str) -> Option<&'a str> {
    query
        .split('&')
        .filter_map(|kv| kv.split_once('='))
        .find(|(k, _)| *k == key)
        .map(|(_, v)| v)
}

fn header(name: &str, value: &str) -> Header {
    Header::from_bytes(name, value).expect("valid header")
}

fn respond_err(req: tiny_http::Request, code: u16, msg: &str) {
    let body = serde_json::json!({"errors": [{"message": msg}]}).to_string();
    let _ = req.respond(
        Response::from_string(body)
            .with_status_code(StatusCode(code))
            .with_header(header("Content-Type", "application/json")),
    );
}

fn respond_created(req: tiny_http::Request, location: &str, digest: &str) {
    let _ = req.respond(
        Response::empty(201)
            .with_header(header("Location", location))
            .with_header(header("Docker-Content-Digest", digest)),
    );
}

fn read_body(req: &mut tiny_http::Request) -> Option<Vec<u8>> {
    let mut body = Vec::new();
    if req.as_reader().read_to_end(&mut body).is_ok() {
        Some(body)
    } else {
        None
    }
}

fn handle_blob(store: &Store, req: tiny_http::Request, method: &Method, repo: &str, digest: &str) {
    match *method {
        Method::Get => match store.get_blob(repo, digest) {
            Some(data) => {
                let _ = req.respond(
                    Response::from_data(data)
                        .with_header(header("Content-Type", "application/octet-stream"))
                        .with_header(header("Docker-Content-Digest", digest)),
                );
            }
            None => respond_err(req, 404, "blob unknown"),
        },
        Method::Head => {
            let code = if store.has_blob(repo, digest) { 200 } else { 404 };
            let _ = req.respond(Response::empty(code));
        }
        _ => respond_err(req, 405, "method not allowed"),
    }
}

fn handle_start_upload(store: &Store, req: tiny_http::Request, repo: &str, query: &str) {
    if let (Some(digest), Some(from)) = (query_param(query, "mount"), query_param(query, "from")) {
        if store.mount(repo, from, digest) {
            info!("mounted {digest} from {from} into {repo}");
            respond_created(req, &format!("/v2/{repo}/blobs/{digest}"), digest);
            return;
        }
        debug!("mount of {digest} from {from} not possible, starting upload");
    }
    let id = store.next_upload.fetch_add(1, Ordering::SeqCst);
    let _ = req.respond(
        Response::empty(202).with_header(header("Location", &format!("/v2/{repo}/blobs/uploads/{id}"))),
    );
}

fn handle_finish_upload(store: &Store, mut req: tiny_http::Request, repo: &str, query: &str) {
    let Some(digest) = query_param(query, "digest").map(str::to_owned) else {
        respond_err(req, 400, "digest parameter required");
        return;
    };
    let Some(body) = read_body(&mut req) else {
        respond_err(req, 500, "read error");
        return;
    };
    match store.put_blob(repo, &digest, &body) {
        Ok(()) => {
            store.uploads.fetch_add(1, Ordering::SeqCst);
            info!("PUT blob {repo}@{digest}: {} bytes", body.len());
            respond_created(req, &format!("/v2/{repo}/blobs/{digest}"), &digest);
        }
        Err(e) => {
            error!("PUT blob {repo}@{digest}: {e}");
            respond_err(req, 400, &e);
        }
    }
}

fn handle_manifest(
    store: &Store,
    mut req: tiny_http::Request,
    method: &Method,
    repo: &str,
    reference: &str,
) {
    match *method {
        Method::Get | Method::Head => match store.get_manifest(repo, reference) {
            Some((data, digest)) => {
                let media_type = serde_json::from_slice::<serde_json::Value>(&data)
                    .ok()
                    .and_then(|v| v["mediaType"].as_str().map(str::to_owned))
                    .unwrap_or_else(|| OCI_MANIFEST.to_owned());
                let body = if *method == Method::Head { Vec::new() } else { data };
                let _ = req.respond(
                    Response::from_data(body)
                        .with_header(header("Content-Type", &media_type))
                        .with_header(header("Docker-Content-Digest", &digest)),
                );
            }
            None => respond_err(req, 404, "manifest unknown"),
        },
        Method::Put => {
            let Some(body) = read_body(&mut req) else {
                respond_err(req, 500, "read error");
                return;
            };
            match store.put_manifest(repo, reference, &body) {
                Ok(digest) => {
                    info!("PUT manifest {repo}:{reference} -> {digest}");
                    respond_created(req, &format!("/v2/{repo}/manifests/{digest}"), &digest);
                }
                Err(e) => {
                    error!("PUT manifest {repo}:{reference}: {e}");
                    respond_err(req, 400, &e);
                }
            }
        }
        _ => respond_err(req, 405, "method not allowed"),
    }
}

/// Handle a single HTTP request, dispatching to the appropriate route handler.
pub fn handle_request(store: &Store, req: tiny_http::Request) {
    let method = req.method().clone();
    let url = req.url().to_owned();
    debug!("{method} {url}");

    let (path, query) = url.split_once('?').unwrap_or((url.as_str(), ""));
    let Some(route) = parse_route(path) else {
        respond_err(req, 404, "not found");
        return;
    };

    let writes = matches!(method, Method::Put | Method::Post);
    match route {
        Route::StartUpload { repo } | Route::FinishUpload { repo, .. } | Route::Manifest { repo, .. }
            if writes && store.is_read_only(repo) =>
        {
            respond_err(req, 403, "repository is read-only");
        }
        Route::Base => {
            let _ = req.respond(
                Response::from_string("{}").with_header(header("Content-Type", "application/json")),
            );
        }
        Route::Blob { repo, digest } => handle_blob(store, req, &method, repo, digest),
        Route::StartUpload { repo } if method == Method::Post => {
            handle_start_upload(store, req, repo, query);
        }
        Route::FinishUpload { repo, .. } if method == Method::Put => {
            handle_finish_upload(store, req, repo, query);
        }
        Route::Manifest { repo, reference } => {
            handle_manifest(store, req, &method, repo, reference);
        }
        Route::StartUpload { .. } | Route::FinishUpload { .. } => {
            respond_err(req, 405, "method not allowed");
        }
    }
}

/// Start the server loop, blocking the current thread.
pub fn run_server(store: &Arc<Store>, addr: &str) {
    let server = Server::http(addr).expect("failed to bind HTTP server");
    for request in server.incoming_requests() {
        handle_request(store, request);
    }
}

/// A test helper that starts a registry on a random port in a background thread.
///
/// The server listens on `127.0.0.1:{port}`; `host` is the registry host to put
/// in image references. Drop the `TestServer` to stop the server (via `Server::unblock`).
pub struct TestServer {
    pub url: String,
    pub host: String,
    pub port: u16,
    pub data_dir: PathBuf,
    pub store: Arc<Store>,
    server: Arc<Server>,
    _handle: std::thread::JoinHandle<()>,
}

impl TestServer {
    /// Start a test registry with data in `data_dir`. Binds to `127.0.0.1:0` (random port).
    pub fn start(data_dir: PathBuf) -> Self {
        fs::create_dir_all(&data_dir).expect("failed to create test data dir");
        let server =
            Arc::new(Server::http("127.0.0.1:0").expect("failed to bind test HTTP server"));
        let port = server.server_addr().to_ip().expect("not an IP addr").port();
        let host = format!("127.0.0.1:{port}");
        let url = format!("http://{host}");

        let store = Arc::new(Store::new(data_dir.clone()));
        let srv = Arc::clone(&server);
        let st = Arc::clone(&store);
        let handle = std::thread::spawn(move || {
            for request in srv.incoming_requests() {
                handle_request(&st, request);
            }
        });

        Self {
            url,
            host,
            port,
            data_dir,
            store,
            server,
            _handle: handle,
        }
    }

    /// Seed `repo:tag` directly into the store from raw layer contents and a
    /// config JSON whose `rootfs.diff_ids` is filled in here. Returns the manifest digest.
    pub fn seed_image(
        &self,
        repo: &str,
        tag: &str,
        layers: &[&[u8]],
        mut config: serde_json::Value,
    ) -> String {
        let mut layer_descs = Vec::new();
        let mut diff_ids = Vec::new();
        for data in layers {
            let digest = sha256_digest(data);
            self.store
                .put_blob(repo, &digest, data)
                .expect("seed layer blob");
            layer_descs.push(serde_json::json!({
                "mediaType": "application/vnd.oci.image.layer.v1.tar",
                "digest": digest,
                "size": data.len(),
            }));
            diff_ids.push(digest);
        }
        config["rootfs"] = serde_json::json!({"type": "layers", "diff_ids": diff_ids});
        let config_bytes = serde_json::to_vec(&config).expect("config JSON");
        let config_digest = sha256_digest(&config_bytes);
        self.store
            .put_blob(repo, &config_digest, &config_bytes)
            .expect("seed config blob");
        let manifest = serde_json::json!({
            "schemaVersion": 2,
            "mediaType": OCI_MANIFEST,
            "config": {
                "mediaType": "application/vnd.oci.image.config.v1+json",
                "digest": config_digest,
                "size": config_bytes.len(),
            },
            "layers": layer_descs,
        });
        let manifest_bytes = serde_json::to_vec(&manifest).expect("manifest JSON");
        self.store
            .put_manifest(repo, tag, &manifest_bytes)
            .expect("seed manifest")
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.server.unblock();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn digest_of(data: &[u8]) -> String {
        sha256_digest(data)
    }

    #[test]
    fn parse_routes() {
        assert_eq!(parse_route("/v2/"), Some(Route::Base));
        assert_eq!(
            parse_route("/v2/team/app/manifests/latest"),
            Some(Route::Manifest {
                repo: "team/app",
                reference: "latest"
            })
        );
        assert_eq!(
            parse_route("/v2/team/app/blobs/uploads/"),
            Some(Route::StartUpload { repo: "team/app" })
        );
        assert_eq!(
            parse_route("/v2/team/app/blobs/uploads/7"),
            Some(Route::FinishUpload {
                repo: "team/app",
                id: "7"
            })
        );
        assert_eq!(
            parse_route("/v2/app/blobs/sha256:ab"),
            Some(Route::Blob {
                repo: "app",
                digest: "sha256:ab"
            })
        );
        assert!(parse_route("/v1/app").is_none());
        assert!(parse_route("/v2/app").is_none());
    }

    #[test]
    fn query_params() {
        let q = "mount=sha256:ab&from=team/base";
        assert_eq!(query_param(q, "mount"), Some("sha256:ab"));
        assert_eq!(query_param(q, "from"), Some("team/base"));
        assert_eq!(query_param(q, "digest"), None);
    }

    #[test]
    fn blobs_are_scoped_to_repositories() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::new(dir.path().to_path_buf());
        let digest = digest_of(b"layer");

        store.put_blob("base", &digest, b"layer").unwrap();
        assert!(store.has_blob("base", &digest));
        assert!(!store.has_blob("app", &digest));

        assert!(store.mount("app", "base", &digest));
        assert_eq!(store.get_blob("app", &digest), Some(b"layer".to_vec()));
        assert_eq!(store.mount_count(), 1);
        assert!(!store.mount("app", "elsewhere", &digest_of(b"other")));
    }

    #[test]
    fn put_blob_rejects_wrong_digest() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::new(dir.path().to_path_buf());
        assert!(store.put_blob("app", &digest_of(b"a"), b"b").is_err());
    }

    #[test]
    fn manifest_requires_linked_blobs() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::new(dir.path().to_path_buf());
        let layer = digest_of(b"l");
        let manifest = serde_json::json!({
            "schemaVersion": 2,
            "config": {"mediaType": "c", "digest": digest_of(b"c"), "size": 1},
            "layers": [{"mediaType": "l", "digest": layer, "size": 1}],
        })
        .to_string();
        assert!(store.put_manifest("app", "1", manifest.as_bytes()).is_err());

        store.put_blob("app", &digest_of(b"c"), b"c").unwrap();
        store.put_blob("app", &layer, b"l").unwrap();
        let digest = store.put_manifest("app", "1", manifest.as_bytes()).unwrap();
        let (data, by_tag) = store.get_manifest("app", "1").unwrap();
        assert_eq!(by_tag, digest);
        assert_eq!(store.get_manifest("app", &digest).unwrap().0, data);
    }
}
