//! Raw HTTP checks of the registry routes, using `ureq` as a plain client.

use std::io::Read;
use strata_registry::{sha256_digest, TestServer};

fn start_server() -> (TestServer, tempfile::TempDir) {
    let dir = tempfile::tempdir().unwrap();
    let server = TestServer::start(dir.path().to_path_buf());
    (server, dir)
}

fn agent() -> ureq::Agent {
    ureq::Agent::config_builder()
        .http_status_as_error(false)
        .build()
        .into()
}

#[test]
fn version_check_answers() {
    let (server, _dir) = start_server();
    let resp = agent().get(&format!("{}/v2/", server.url)).call().unwrap();
    assert_eq!(resp.status().as_u16(), 200);
}

#[test]
fn monolithic_upload_then_fetch() {
    let (server, _dir) = start_server();
    let agent = agent();
    let data = b"layer bytes";
    let digest = sha256_digest(data);

    let resp = agent
        .post(&format!("{}/v2/team/app/blobs/uploads/", server.url))
        .send_empty()
        .unwrap();
    assert_eq!(resp.status().as_u16(), 202);
    let location = resp
        .headers()
        .get("Location")
        .and_then(|v| v.to_str().ok())
        .unwrap()
        .to_owned();

    let resp = agent
        .put(&format!("{}{location}?digest={digest}", server.url))
        .send(&data[..])
        .unwrap();
    assert_eq!(resp.status().as_u16(), 201);

    let head = agent
        .head(&format!("{}/v2/team/app/blobs/{digest}", server.url))
        .call()
        .unwrap();
    assert_eq!(head.status().as_u16(), 200);

    let resp = agent
        .get(&format!("{}/v2/team/app/blobs/{digest}", server.url))
        .call()
        .unwrap();
    let mut body = Vec::new();
    resp.into_body().into_reader().read_to_end(&mut body).unwrap();
    assert_eq!(body, data);
    assert_eq!(server.store.upload_count(), 1);
}

#[test]
fn upload_with_wrong_digest_is_rejected() {
    let (server, _dir) = start_server();
    let resp = agent()
        .put(&format!(
            "{}/v2/app/blobs/uploads/0?digest={}",
            server.url,
            sha256_digest(b"expected")
        ))
        .send(&b"actual"[..])
        .unwrap();
    assert_eq!(resp.status().as_u16(), 400);
}

#[test]
fn cross_repository_mount() {
    let (server, _dir) = start_server();
    server.seed_image("team/base", "1", &[b"base"], serde_json::json!({}));
    let digest = sha256_digest(b"base");

    let resp = agent()
        .post(&format!(
            "{}/v2/team/app/blobs/uploads/?mount={digest}&from=team/base",
            server.url
        ))
        .send_empty()
        .unwrap();
    assert_eq!(resp.status().as_u16(), 201);
    assert!(server.store.has_blob("team/app", &digest));
    assert_eq!(server.store.mount_count(), 1);

    let resp = agent()
        .post(&format!(
            "{}/v2/team/app/blobs/uploads/?mount={}&from=team/base",
            server.url,
            sha256_digest(b"absent")
        ))
        .send_empty()
        .unwrap();
    assert_eq!(resp.status().as_u16(), 202);
}

#[test]
fn seeded_manifest_is_served_by_tag() {
    let (server, _dir) = start_server();
    let digest = server.seed_image("app", "v1", &[b"a", b"b"], serde_json::json!({"os": "linux"}));
    let resp = agent()
        .get(&format!("{}/v2/app/manifests/v1", server.url))
        .call()
        .unwrap();
    assert_eq!(resp.status().as_u16(), 200);
    let header = resp
        .headers()
        .get("Docker-Content-Digest")
        .and_then(|v| v.to_str().ok())
        .unwrap()
        .to_owned();
    assert_eq!(header, digest);
}

#[test]
fn read_only_repository_rejects_writes() {
    let (server, _dir) = start_server();
    server.store.set_read_only("locked");
    let resp = agent()
        .post(&format!("{}/v2/locked/blobs/uploads/", server.url))
        .send_empty()
        .unwrap();
    assert_eq!(resp.status().as_u16(), 403);
}
