//! End-to-end pulls against a mock registry.

use std::fs::File;
use std::io::Read;
use std::path::Path;

use flate2::read::GzDecoder;
use hoist_core::{AuthErrorKind, EndpointConfig, EventEmitter, HoistError, Outcome, Platform, Stage};
use hoist_registry::manifest::media_types;
use hoist_registry::{Digest, DigestAlgorithm, ImageReference, RegistryClient};
use tempfile::TempDir;
use wiremock::matchers::{header, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

const TOKEN: &str = "test-token-abc";

struct TestImage {
    config: Vec<u8>,
    layers: Vec<Vec<u8>>,
}

impl TestImage {
    fn new(arch: &str) -> Self {
        Self {
            config: format!(r#"{{"architecture":"{}","os":"linux"}}"#, arch).into_bytes(),
            layers: vec![
                format!("{} base layer", arch).into_bytes(),
                format!("{} app layer", arch).into_bytes(),
            ],
        }
    }

    fn manifest(&self) -> Vec<u8> {
        let layers: Vec<serde_json::Value> = self
            .layers
            .iter()
            .map(|l| {
                serde_json::json!({
                    "mediaType": "application/vnd.docker.image.rootfs.diff.tar.gzip",
                    "size": l.len(),
                    "digest": sha256(l)
                })
            })
            .collect();
        serde_json::to_vec(&serde_json::json!({
            "schemaVersion": 2,
            "mediaType": media_types::DOCKER_MANIFEST,
            "config": {
                "mediaType": "application/vnd.docker.container.image.v1+json",
                "size": self.config.len(),
                "digest": sha256(&self.config)
            },
            "layers": layers
        }))
        .unwrap()
    }
}

fn sha256(data: &[u8]) -> String {
    Digest::of_bytes(DigestAlgorithm::Sha256, data).to_string()
}

fn auth_header(token: Option<&str>) -> Option<String> {
    token.map(|t| format!("Bearer {}", t))
}

async fn mount_open_registry(server: &MockServer) {
    Mock::given(method("GET"))
        .and(path("/v2/"))
        .respond_with(ResponseTemplate::new(200))
        .mount(server)
        .await;
}

async fn mount_token_registry(server: &MockServer, repository: &str) {
    let challenge = format!(
        r#"Bearer realm="{}/token",service="registry.test",scope="repository:{}:pull""#,
        server.uri(),
        repository
    );
    Mock::given(method("GET"))
        .and(path("/v2/"))
        .respond_with(ResponseTemplate::new(401).insert_header("WWW-Authenticate", challenge.as_str()))
        .mount(server)
        .await;
    Mock::given(method("GET"))
        .and(path("/token"))
        .and(query_param("service", "registry.test"))
        .and(query_param("scope", format!("repository:{}:pull", repository).as_str()))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "token": TOKEN,
            "expires_in": 300
        })))
        .mount(server)
        .await;
}

async fn mount_blob(server: &MockServer, repository: &str, digest: &str, body: Vec<u8>, token: Option<&str>) {
    let mut mock = Mock::given(method("GET")).and(path(format!("/v2/{}/blobs/{}", repository, digest)));
    if let Some(value) = auth_header(token) {
        mock = mock.and(header("authorization", value.as_str()));
    }
    mock.respond_with(ResponseTemplate::new(200).set_body_bytes(body))
        .mount(server)
        .await;
}

async fn mount_manifest(
    server: &MockServer,
    repository: &str,
    reference: &str,
    body: Vec<u8>,
    media_type: &str,
    token: Option<&str>,
) {
    let mut mock = Mock::given(method("GET"))
        .and(path(format!("/v2/{}/manifests/{}", repository, reference)));
    if let Some(value) = auth_header(token) {
        mock = mock.and(header("authorization", value.as_str()));
    }
    mock.respond_with(ResponseTemplate::new(200).set_body_raw(body, media_type))
        .mount(server)
        .await;
}

async fn mount_image(server: &MockServer, repository: &str, tag: &str, image: &TestImage, token: Option<&str>) {
    mount_manifest(server, repository, tag, image.manifest(), media_types::DOCKER_MANIFEST, token).await;
    mount_blob(server, repository, &sha256(&image.config), image.config.clone(), token).await;
    for layer in &image.layers {
        mount_blob(server, repository, &sha256(layer), layer.clone(), token).await;
    }
}

fn client_for(server: &MockServer, scratch: &Path, platform: Platform) -> RegistryClient {
    RegistryClient::new(EndpointConfig {
        index_url: server.uri(),
        platform,
        scratch_dir: Some(scratch.to_path_buf()),
        timeout_secs: 10,
        ..Default::default()
    })
    .unwrap()
}

fn archive_entries(archive: &Path) -> Vec<(String, Vec<u8>)> {
    let mut tar = tar::Archive::new(GzDecoder::new(File::open(archive).unwrap()));
    tar.entries()
        .unwrap()
        .map(|e| {
            let mut e = e.unwrap();
            let name = e.path().unwrap().to_string_lossy().into_owned();
            let mut data = Vec::new();
            e.read_to_end(&mut data).unwrap();
            (name, data)
        })
        .collect()
}

fn is_empty_dir(dir: &Path) -> bool {
    std::fs::read_dir(dir).unwrap().next().is_none()
}

#[tokio::test]
async fn test_pull_with_token_auth() {
    let server = MockServer::start().await;
    let repository = "library/busybox";
    let image = TestImage::new("amd64");
    mount_token_registry(&server, repository).await;
    mount_image(&server, repository, "latest", &image, Some(TOKEN)).await;

    let scratch = TempDir::new().unwrap();
    let out = TempDir::new().unwrap();
    let events = EventEmitter::new(64);
    let mut rx = events.subscribe();
    let client = client_for(&server, scratch.path(), Platform::new("linux", "amd64")).with_events(events);

    let reference = ImageReference::parse("busybox").unwrap();
    let summary = client.pull(&reference, out.path()).await.unwrap();

    assert_eq!(summary.path, out.path().join("library_busybox.tar.gz"));
    assert_eq!(summary.layers, 2);
    assert!(summary.size > 0);
    assert!(is_empty_dir(scratch.path()));

    let entries = archive_entries(&summary.path);
    let (name, index) = entries.last().unwrap();
    assert_eq!(name, "manifest.json");
    let index: serde_json::Value = serde_json::from_slice(index).unwrap();
    assert_eq!(index[0]["RepoTags"][0], "library/busybox:latest");

    let config_name = format!("{}.json", &sha256(&image.config)["sha256:".len()..]);
    assert_eq!(index[0]["Config"], config_name.as_str());
    let config_entry = entries.iter().find(|(n, _)| *n == config_name).unwrap();
    assert_eq!(config_entry.1, image.config);

    for (i, layer) in image.layers.iter().enumerate() {
        let layer_name = format!("{}/layer.tar", &sha256(layer)["sha256:".len()..]);
        assert_eq!(index[0]["Layers"][i], layer_name.as_str());
        let entry = entries.iter().find(|(n, _)| *n == layer_name).unwrap();
        assert_eq!(&entry.1, layer);
    }

    let mut stages = Vec::new();
    while let Ok(event) = rx.try_recv() {
        if event.outcome == Outcome::Completed {
            stages.push(event.stage);
        }
    }
    assert_eq!(
        stages,
        vec![
            Stage::Authenticate,
            Stage::ResolveManifest,
            Stage::FetchConfig,
            Stage::Assemble,
            Stage::Cleanup
        ]
    );
}

#[tokio::test]
async fn test_pull_from_open_registry() {
    let server = MockServer::start().await;
    let repository = "team/tool";
    let image = TestImage::new("amd64");
    mount_open_registry(&server).await;
    mount_image(&server, repository, "2.1", &image, None).await;

    let scratch = TempDir::new().unwrap();
    let out = TempDir::new().unwrap();
    let client = client_for(&server, scratch.path(), Platform::new("linux", "amd64"));

    let reference = ImageReference::parse("team/tool:2.1").unwrap();
    let summary = client.pull(&reference, out.path()).await.unwrap();
    assert_eq!(summary.path, out.path().join("team_tool.tar.gz"));
    assert!(summary.path.exists());
}

#[tokio::test]
async fn test_pull_with_basic_auth() {
    let server = MockServer::start().await;
    let repository = "private/app";
    let image = TestImage::new("amd64");

    Mock::given(method("GET"))
        .and(path("/v2/"))
        .respond_with(ResponseTemplate::new(401).insert_header("WWW-Authenticate", r#"Basic realm="registry""#))
        .mount(&server)
        .await;
    // "user:pass"
    let basic = "Basic dXNlcjpwYXNz";
    let manifest_path = format!("/v2/{}/manifests/latest", repository);
    Mock::given(method("GET"))
        .and(path(manifest_path.as_str()))
        .and(header("authorization", basic))
        .respond_with(ResponseTemplate::new(200).set_body_raw(image.manifest(), media_types::DOCKER_MANIFEST))
        .mount(&server)
        .await;
    for blob in std::iter::once(&image.config).chain(image.layers.iter()) {
        Mock::given(method("GET"))
            .and(path(format!("/v2/{}/blobs/{}", repository, sha256(blob))))
            .and(header("authorization", basic))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(blob.clone()))
            .mount(&server)
            .await;
    }

    let scratch = TempDir::new().unwrap();
    let out = TempDir::new().unwrap();
    let client = RegistryClient::new(EndpointConfig {
        index_url: server.uri(),
        platform: Platform::new("linux", "amd64"),
        scratch_dir: Some(scratch.path().to_path_buf()),
        credentials: Some(hoist_core::Credentials::new("user", "pass")),
        ..Default::default()
    })
    .unwrap();

    let reference = ImageReference::parse("private/app").unwrap();
    let summary = client.pull(&reference, out.path()).await.unwrap();
    assert!(summary.path.exists());
}

#[tokio::test]
async fn test_list_tags_in_registry_order() {
    let server = MockServer::start().await;
    mount_token_registry(&server, "library/redis").await;
    Mock::given(method("GET"))
        .and(path("/v2/library/redis/tags/list"))
        .and(header("authorization", format!("Bearer {}", TOKEN).as_str()))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "name": "library/redis",
            "tags": ["latest", "1.0", "1.1"]
        })))
        .mount(&server)
        .await;

    let scratch = TempDir::new().unwrap();
    let client = client_for(&server, scratch.path(), Platform::new("linux", "amd64"));
    let tags = client
        .list_tags(&ImageReference::parse("redis").unwrap())
        .await
        .unwrap();
    assert_eq!(tags, vec!["latest", "1.0", "1.1"]);
}

#[tokio::test]
async fn test_list_tags_follows_pagination() {
    let server = MockServer::start().await;
    mount_open_registry(&server).await;

    Mock::given(method("GET"))
        .and(path("/v2/library/redis/tags/list"))
        .and(query_param("last", "1.0"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "name": "library/redis",
            "tags": ["1.0", "1.1", "2.0"]
        })))
        .with_priority(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/v2/library/redis/tags/list"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("Link", r#"</v2/library/redis/tags/list?n=2&last=1.0>; rel="next""#)
                .set_body_json(serde_json::json!({
                    "name": "library/redis",
                    "tags": ["latest", "1.0"]
                })),
        )
        .mount(&server)
        .await;

    let scratch = TempDir::new().unwrap();
    let client = client_for(&server, scratch.path(), Platform::new("linux", "amd64"));
    let tags = client
        .list_tags(&ImageReference::parse("redis").unwrap())
        .await
        .unwrap();
    assert_eq!(tags, vec!["latest", "1.0", "1.1", "2.0"]);
}

#[tokio::test]
async fn test_pull_selects_platform_from_manifest_list() {
    let server = MockServer::start().await;
    let repository = "library/alpine";
    mount_open_registry(&server).await;

    let amd64 = TestImage::new("amd64");
    let arm64 = TestImage::new("arm64");
    let amd64_manifest = amd64.manifest();
    let arm64_manifest = arm64.manifest();

    let list = serde_json::to_vec(&serde_json::json!({
        "schemaVersion": 2,
        "mediaType": media_types::DOCKER_MANIFEST_LIST,
        "manifests": [
            {
                "mediaType": media_types::DOCKER_MANIFEST,
                "size": amd64_manifest.len(),
                "digest": sha256(&amd64_manifest),
                "platform": { "architecture": "amd64", "os": "linux" }
            },
            {
                "mediaType": media_types::DOCKER_MANIFEST,
                "size": arm64_manifest.len(),
                "digest": sha256(&arm64_manifest),
                "platform": { "architecture": "arm64", "os": "linux", "variant": "v8" }
            }
        ]
    }))
    .unwrap();

    mount_manifest(&server, repository, "3.19", list, media_types::DOCKER_MANIFEST_LIST, None).await;
    for image in [&amd64, &arm64] {
        let manifest = image.manifest();
        mount_manifest(&server, repository, &sha256(&manifest), manifest, media_types::DOCKER_MANIFEST, None).await;
        mount_blob(&server, repository, &sha256(&image.config), image.config.clone(), None).await;
        for layer in &image.layers {
            mount_blob(&server, repository, &sha256(layer), layer.clone(), None).await;
        }
    }

    let reference = ImageReference::parse("alpine:3.19").unwrap();
    for (platform, expected) in [
        (Platform::new("linux", "amd64"), &amd64),
        (Platform::new("linux", "arm64"), &arm64),
    ] {
        let scratch = TempDir::new().unwrap();
        let out = TempDir::new().unwrap();
        let client = client_for(&server, scratch.path(), platform);
        let summary = client.pull(&reference, out.path()).await.unwrap();

        let entries = archive_entries(&summary.path);
        let config_name = format!("{}.json", &sha256(&expected.config)["sha256:".len()..]);
        assert!(entries.iter().any(|(n, d)| *n == config_name && *d == expected.config));
    }

    let scratch = TempDir::new().unwrap();
    let out = TempDir::new().unwrap();
    let client = client_for(&server, scratch.path(), Platform::new("windows", "amd64"));
    let err = client.pull(&reference, out.path()).await.unwrap_err();
    match err {
        HoistError::UnsupportedFormat(msg) => {
            assert!(msg.contains("linux/amd64"));
            assert!(msg.contains("linux/arm64/v8"));
        }
        other => panic!("unexpected error: {other:?}"),
    }
    assert!(is_empty_dir(out.path()));
}

#[tokio::test]
async fn test_corrupted_blob_is_integrity_error() {
    let server = MockServer::start().await;
    let repository = "library/busybox";
    let image = TestImage::new("amd64");
    mount_open_registry(&server).await;

    mount_manifest(&server, repository, "latest", image.manifest(), media_types::DOCKER_MANIFEST, None).await;
    mount_blob(&server, repository, &sha256(&image.config), image.config.clone(), None).await;
    mount_blob(&server, repository, &sha256(&image.layers[0]), image.layers[0].clone(), None).await;
    let mut corrupted = image.layers[1].clone();
    corrupted[0] ^= 0x01;
    mount_blob(&server, repository, &sha256(&image.layers[1]), corrupted, None).await;

    let scratch = TempDir::new().unwrap();
    let out = TempDir::new().unwrap();
    let client = client_for(&server, scratch.path(), Platform::new("linux", "amd64"));
    let err = client
        .pull(&ImageReference::parse("busybox").unwrap(), out.path())
        .await
        .unwrap_err();

    match &err {
        HoistError::Integrity { digest, .. } => assert_eq!(*digest, sha256(&image.layers[1])),
        other => panic!("unexpected error: {other:?}"),
    }
    assert!(!err.is_retryable());
    assert!(is_empty_dir(out.path()));
    assert!(is_empty_dir(scratch.path()));
}

#[tokio::test]
async fn test_layer_server_error_leaves_nothing_behind() {
    let server = MockServer::start().await;
    let repository = "library/busybox";
    let image = TestImage::new("amd64");
    mount_open_registry(&server).await;

    mount_manifest(&server, repository, "latest", image.manifest(), media_types::DOCKER_MANIFEST, None).await;
    mount_blob(&server, repository, &sha256(&image.config), image.config.clone(), None).await;
    mount_blob(&server, repository, &sha256(&image.layers[0]), image.layers[0].clone(), None).await;
    Mock::given(method("GET"))
        .and(path(format!("/v2/{}/blobs/{}", repository, sha256(&image.layers[1]))))
        .respond_with(ResponseTemplate::new(500))
        .mount(&server)
        .await;

    let scratch = TempDir::new().unwrap();
    let out = TempDir::new().unwrap();
    let client = client_for(&server, scratch.path(), Platform::new("linux", "amd64"));
    let err = client
        .pull(&ImageReference::parse("busybox").unwrap(), out.path())
        .await
        .unwrap_err();

    assert!(matches!(err, HoistError::Network { .. }));
    assert!(err.is_retryable());
    assert!(is_empty_dir(out.path()));
    assert!(is_empty_dir(scratch.path()));
}

#[tokio::test]
async fn test_failed_layer_cancels_slow_sibling() {
    let server = MockServer::start().await;
    let repository = "library/busybox";
    let image = TestImage::new("amd64");
    mount_open_registry(&server).await;

    mount_manifest(&server, repository, "latest", image.manifest(), media_types::DOCKER_MANIFEST, None).await;
    mount_blob(&server, repository, &sha256(&image.config), image.config.clone(), None).await;
    Mock::given(method("GET"))
        .and(path(format!("/v2/{}/blobs/{}", repository, sha256(&image.layers[0]))))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_bytes(image.layers[0].clone())
                .set_delay(std::time::Duration::from_secs(8)),
        )
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path(format!("/v2/{}/blobs/{}", repository, sha256(&image.layers[1]))))
        .respond_with(ResponseTemplate::new(500))
        .mount(&server)
        .await;

    let scratch = TempDir::new().unwrap();
    let out = TempDir::new().unwrap();
    let client = client_for(&server, scratch.path(), Platform::new("linux", "amd64"));

    let started = std::time::Instant::now();
    let err = client
        .pull(&ImageReference::parse("busybox").unwrap(), out.path())
        .await
        .unwrap_err();

    assert!(started.elapsed() < std::time::Duration::from_secs(4));
    assert!(matches!(err, HoistError::Network { .. }));
    assert!(is_empty_dir(out.path()));
    assert!(is_empty_dir(scratch.path()));
}

#[tokio::test]
async fn test_concurrent_pulls_of_one_repository() {
    let server = MockServer::start().await;
    let repository = "library/redis";
    let six = TestImage::new("amd64");
    let seven = TestImage::new("arm64");
    mount_open_registry(&server).await;
    mount_image(&server, repository, "6", &six, None).await;
    mount_image(&server, repository, "7", &seven, None).await;

    let scratch = TempDir::new().unwrap();
    let out = TempDir::new().unwrap();
    let client = client_for(&server, scratch.path(), Platform::new("linux", "amd64"));
    let redis6 = ImageReference::parse("redis:6").unwrap();
    let redis7 = ImageReference::parse("redis:7").unwrap();

    let (first, second) = tokio::join!(client.pull(&redis6, out.path()), client.pull(&redis7, out.path()));
    let first = first.unwrap();
    let second = second.unwrap();
    assert_eq!(first.path, second.path);

    // Whichever pull committed last owns the archive, and it is whole.
    let entries = archive_entries(&first.path);
    let index: serde_json::Value = serde_json::from_slice(&entries.last().unwrap().1).unwrap();
    let image = match index[0]["RepoTags"][0].as_str().unwrap() {
        "library/redis:6" => &six,
        "library/redis:7" => &seven,
        other => panic!("unexpected tag {other}"),
    };
    let config_name = format!("{}.json", &sha256(&image.config)["sha256:".len()..]);
    assert_eq!(entries[0], (config_name, image.config.clone()));

    let names: Vec<String> = std::fs::read_dir(out.path())
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
        .collect();
    assert_eq!(names, vec!["library_redis.tar.gz".to_string()]);
    assert!(is_empty_dir(scratch.path()));
}

#[tokio::test]
async fn test_pull_is_byte_identical_across_runs() {
    let server = MockServer::start().await;
    let repository = "library/busybox";
    let image = TestImage::new("amd64");
    mount_open_registry(&server).await;
    mount_image(&server, repository, "latest", &image, None).await;

    let reference = ImageReference::parse("busybox:latest").unwrap();
    let mut archives = Vec::new();
    for _ in 0..2 {
        let scratch = TempDir::new().unwrap();
        let out = TempDir::new().unwrap();
        let client = client_for(&server, scratch.path(), Platform::new("linux", "amd64"));
        let summary = client.pull(&reference, out.path()).await.unwrap();
        archives.push(std::fs::read(&summary.path).unwrap());
    }
    assert_eq!(archives[0], archives[1]);
}

#[tokio::test]
async fn test_missing_tag_is_not_found() {
    let server = MockServer::start().await;
    mount_open_registry(&server).await;
    Mock::given(method("GET"))
        .and(path("/v2/library/busybox/manifests/nope"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;

    let scratch = TempDir::new().unwrap();
    let out = TempDir::new().unwrap();
    let client = client_for(&server, scratch.path(), Platform::new("linux", "amd64"));
    let err = client
        .pull(&ImageReference::parse("busybox:nope").unwrap(), out.path())
        .await
        .unwrap_err();
    assert!(matches!(err, HoistError::NotFound { .. }));
    assert!(err.to_string().contains("library/busybox:nope"));
}

#[tokio::test]
async fn test_token_service_rejection_is_unauthorized() {
    let server = MockServer::start().await;
    let challenge = format!(r#"Bearer realm="{}/token",service="registry.test""#, server.uri());
    Mock::given(method("GET"))
        .and(path("/v2/"))
        .respond_with(ResponseTemplate::new(401).insert_header("WWW-Authenticate", challenge.as_str()))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/token"))
        .respond_with(ResponseTemplate::new(401))
        .mount(&server)
        .await;

    let scratch = TempDir::new().unwrap();
    let out = TempDir::new().unwrap();
    let client = client_for(&server, scratch.path(), Platform::new("linux", "amd64"));
    let err = client
        .pull(&ImageReference::parse("busybox").unwrap(), out.path())
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        HoistError::Auth {
            kind: AuthErrorKind::Unauthorized,
            ..
        }
    ));
}
