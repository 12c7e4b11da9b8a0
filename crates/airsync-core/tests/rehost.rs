mod support;

use std::sync::Arc;

use airsync_core::{LocalStore, MediaRehoster, ObjectStore, RawRecord, RehostOptions, Tier};
use serde_json::json;
use support::{FakeServer, Reply, png, quick_retry};

async fn media_server() -> FakeServer {
    FakeServer::start(|request| match request.path() {
        "/media/main.png" => Reply::bytes("image/png", png(400, 200)),
        "/media/big.bin" => Reply::bytes("application/octet-stream", vec![7u8; 4096]),
        "/media/notes.txt" => Reply::bytes("text/plain; charset=utf-8", b"hello".to_vec()),
        _ => Reply::status(404),
    })
    .await
}

fn rehoster(store: Arc<LocalStore>) -> MediaRehoster {
    MediaRehoster::new(reqwest::Client::new(), store).with_retry(quick_retry())
}

fn local_store(dir: &tempfile::TempDir) -> Arc<LocalStore> {
    Arc::new(LocalStore::new(dir.path()).with_public_base("https://cdn.example.com"))
}

#[tokio::test]
async fn uploads_original_and_requested_tiers() {
    let server = media_server().await;
    let dir = tempfile::tempdir().unwrap();
    let store = local_store(&dir);
    let media = rehoster(store.clone());

    let options = RehostOptions {
        image_tiers: vec![Tier::Tiny, Tier::Medium],
        ..RehostOptions::default()
    };
    let outcome = media
        .upload_from_url(&server.url("/media/main.png"), "contents/rec1/main.png", &options)
        .await
        .unwrap();

    assert_eq!(outcome.location, "https://cdn.example.com/contents/rec1/main.png");
    assert!(!outcome.skipped);
    assert_eq!(outcome.content_type.as_deref(), Some("image/png"));
    assert_eq!(
        outcome.variants.get(&Tier::Tiny).map(String::as_str),
        Some("https://cdn.example.com/contents/rec1/main_tiny.png")
    );
    assert!(outcome.variants.contains_key(&Tier::Medium));
    assert!(dir.path().join("contents/rec1/main.png").exists());
    assert!(dir.path().join("contents/rec1/main_tiny.png").exists());
    assert!(dir.path().join("contents/rec1/main_medium.png").exists());
}

#[tokio::test]
async fn oversized_media_keeps_the_original_url() {
    let server = media_server().await;
    let dir = tempfile::tempdir().unwrap();
    let media = rehoster(local_store(&dir));

    let source = server.url("/media/big.bin");
    let options = RehostOptions {
        max_bytes: Some(1024),
        ..RehostOptions::default()
    };
    let outcome = media.upload_from_url(&source, "worlds/w1/big.bin", &options).await.unwrap();

    assert!(outcome.skipped);
    assert!(!outcome.failed);
    assert_eq!(outcome.location, source);
    assert!(!dir.path().join("worlds/w1/big.bin").exists());
}

#[tokio::test]
async fn content_type_parameters_are_stripped() {
    let server = media_server().await;
    let dir = tempfile::tempdir().unwrap();
    let media = rehoster(local_store(&dir));

    let outcome = media
        .upload_from_url(&server.url("/media/notes.txt"), "k/notes.txt", &RehostOptions::default())
        .await
        .unwrap();
    assert_eq!(outcome.content_type.as_deref(), Some("text/plain"));
    assert!(outcome.variants.is_empty());
}

#[tokio::test]
async fn missing_media_fails_after_every_attempt() {
    let server = media_server().await;
    let dir = tempfile::tempdir().unwrap();
    let media = rehoster(local_store(&dir));

    let result = media
        .upload_from_url(&server.url("/media/gone.png"), "k/gone.png", &RehostOptions::default())
        .await;
    assert!(result.is_err());
    assert_eq!(server.requests().len(), 3);
}

#[tokio::test]
async fn record_attachments_are_rewritten_in_place() {
    let server = media_server().await;
    let dir = tempfile::tempdir().unwrap();
    let store = local_store(&dir);
    let media = rehoster(store.clone());

    let already_hosted = store.public_url("contents/rec1/old.png");
    let record = RawRecord::new("rec1")
        .with_field("*액티비티 타이틀", json!("Test"))
        .with_field(
            "*메인 이미지",
            json!([{
                "id": "att1",
                "url": server.url("/media/main.png"),
                "filename": "main.png",
                "type": "image/png",
                "thumbnails": { "small": { "url": server.url("/thumb/small.png") } }
            }]),
        )
        .with_field("활동 가이드 1_이미지", json!([{ "url": already_hosted, "filename": "old.png" }]));

    let rehosted = media
        .rehost_record(&record, "contents/rec1", &RehostOptions::default())
        .await;

    assert!(rehosted.is_complete());
    assert_eq!(rehosted.uploaded, 1);
    let main = rehosted.record.attachments("*메인 이미지");
    assert_eq!(main[0].url, "https://cdn.example.com/contents/rec1/main.png");
    assert_eq!(main[0].id.as_deref(), Some("att1"));
    assert!(main[0].thumbnails.is_empty());
    assert_eq!(
        rehosted.record.attachments("활동 가이드 1_이미지")[0].url,
        already_hosted
    );
    assert_eq!(rehosted.record.fields["*액티비티 타이틀"], "Test");
}

#[tokio::test]
async fn failed_attachment_is_reported_and_left_untouched() {
    let server = media_server().await;
    let dir = tempfile::tempdir().unwrap();
    let media = rehoster(local_store(&dir));

    let missing = server.url("/media/missing.png");
    let record = RawRecord::new("rec2").with_field(
        "*메인 이미지",
        json!([{ "url": missing, "filename": "missing.png" }]),
    );
    let rehosted = media
        .rehost_record(&record, "contents/rec2", &RehostOptions::default())
        .await;

    assert!(!rehosted.is_complete());
    assert_eq!(rehosted.failures.len(), 1);
    assert_eq!(rehosted.record.attachments("*메인 이미지")[0].url, missing);
}

/// Serves source media under `/media` and whatever the store wrote under `/hosted`.
async fn hosting_server(root: std::path::PathBuf) -> FakeServer {
    FakeServer::start(move |request| {
        let path = request.path();
        if let Some(key) = path.strip_prefix("/hosted/") {
            return match std::fs::read(root.join(key)) {
                Ok(bytes) => Reply::bytes("image/png", bytes),
                Err(_) => Reply::status(404),
            };
        }
        match path {
            "/media/small.png" => Reply::bytes("image/png", png(32, 32)),
            _ => Reply::status(404),
        }
    })
    .await
}

#[tokio::test]
async fn measured_dimensions_are_appended_to_the_location() {
    let dir = tempfile::tempdir().unwrap();
    let server = hosting_server(dir.path().to_path_buf()).await;
    let store = Arc::new(LocalStore::new(dir.path()).with_public_base(server.url("/hosted")));
    let media = rehoster(store);

    let options = RehostOptions {
        probe_dimensions: true,
        ..RehostOptions::default()
    };
    let outcome = media
        .upload_from_url(&server.url("/media/small.png"), "worlds/w1/small.png", &options)
        .await
        .unwrap();

    assert_eq!(
        outcome.location,
        format!("{}?width=32&height=32", server.url("/hosted/worlds/w1/small.png"))
    );
    assert_eq!((outcome.width, outcome.height), (Some(32), Some(32)));
    let ranged = server
        .requests()
        .into_iter()
        .find(|request| request.path() == "/hosted/worlds/w1/small.png")
        .unwrap();
    assert_eq!(ranged.header("range"), Some("bytes=0-65535"));
}

#[tokio::test]
async fn unmeasurable_media_keeps_the_bare_location() {
    let dir = tempfile::tempdir().unwrap();
    let server = hosting_server(dir.path().to_path_buf()).await;
    let store = Arc::new(LocalStore::new(dir.path()).with_public_base(server.url("/unserved")));
    let media = rehoster(store);

    let options = RehostOptions {
        probe_dimensions: true,
        ..RehostOptions::default()
    };
    let outcome = media
        .upload_from_url(&server.url("/media/small.png"), "worlds/w1/small.png", &options)
        .await
        .unwrap();

    assert_eq!(outcome.location, server.url("/unserved/worlds/w1/small.png"));
    assert_eq!(outcome.width, None);
    assert!(dir.path().join("worlds/w1/small.png").exists());
}

#[tokio::test]
async fn same_file_names_in_one_record_get_distinct_keys() {
    let server = media_server().await;
    let dir = tempfile::tempdir().unwrap();
    let media = rehoster(local_store(&dir));

    let pasted = |path: &str| json!([{ "url": server.url(path), "filename": "image.png" }]);
    let record = RawRecord::new("rec3")
        .with_field("*메인 이미지", pasted("/media/main.png"))
        .with_field("활동 가이드 1_이미지", pasted("/media/notes.txt"));

    let rehosted = media
        .rehost_record(&record, "contents/rec3", &RehostOptions::default())
        .await;

    assert!(rehosted.is_complete());
    let main = &rehosted.record.attachments("*메인 이미지")[0].url;
    let guide = &rehosted.record.attachments("활동 가이드 1_이미지")[0].url;
    assert_eq!(main, "https://cdn.example.com/contents/rec3/image.png");
    assert_eq!(guide, "https://cdn.example.com/contents/rec3/image_2.png");
    assert_eq!(std::fs::read(dir.path().join("contents/rec3/image_2.png")).unwrap(), b"hello");
}

#[tokio::test]
async fn unreadable_attachments_survive_rehosting() {
    let server = media_server().await;
    let dir = tempfile::tempdir().unwrap();
    let media = rehoster(local_store(&dir));

    let odd = json!({ "url": "https://dl.example.com/odd.png", "width": "wide" });
    let record = RawRecord::new("rec4").with_field(
        "*메인 이미지",
        json!([{ "url": server.url("/media/main.png"), "filename": "main.png" }, odd.clone()]),
    );

    let rehosted = media
        .rehost_record(&record, "contents/rec4", &RehostOptions::default())
        .await;

    let items = rehosted.record.fields["*메인 이미지"].as_array().unwrap();
    assert_eq!(items.len(), 2);
    assert_eq!(items[0]["url"], "https://cdn.example.com/contents/rec4/main.png");
    assert_eq!(items[1], odd);
}
