//! HTTP surface tests against a server bound to an ephemeral port.

use std::time::Duration;

use knowledge_harness::app::App;
use knowledge_harness::config::parse_config;
use knowledge_harness::server::router;
use serde_json::Value;
use tempfile::TempDir;

async fn start() -> (TempDir, String) {
    let tmp = TempDir::new().unwrap();
    let config = parse_config(&format!(
        r#"[db]
path = "{root}/kb.sqlite"

[storage]
root = "{root}/objects"

[chunking]
chunk_size = 32
chunk_overlap = 4

[extract]
max_file_bytes = 1024
"#,
        root = tmp.path().display()
    ))
    .unwrap();
    let app = App::from_config(config).await.unwrap();

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let base = format!("http://{}", listener.local_addr().unwrap());
    tokio::spawn(async move {
        axum::serve(listener, router(app)).await.unwrap();
    });
    (tmp, base)
}

async fn upload(client: &reqwest::Client, base: &str, name: &str, body: &[u8]) -> reqwest::Response {
    let part = reqwest::multipart::Part::bytes(body.to_vec()).file_name(name.to_string());
    let form = reqwest::multipart::Form::new().part("file", part);
    client
        .post(format!("{}/documents", base))
        .multipart(form)
        .send()
        .await
        .unwrap()
}

/// Poll until the document leaves `pending`/`processing`.
async fn wait_terminal(client: &reqwest::Client, base: &str, id: &str) -> Value {
    for _ in 0..100 {
        let doc: Value = client
            .get(format!("{}/documents/{}", base, id))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        if doc["status"] == "completed" || doc["status"] == "failed" {
            return doc;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    panic!("document {} never reached a terminal status", id);
}

#[tokio::test]
async fn health_reports_version() {
    let (_tmp, base) = start().await;
    let body: Value = reqwest::get(format!("{}/health", base))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body["status"], "ok");
    assert_eq!(body["version"], env!("CARGO_PKG_VERSION"));
}

#[tokio::test]
async fn upload_is_ingested_in_background() {
    let (_tmp, base) = start().await;
    let client = reqwest::Client::new();

    let text = b"Upload surface test document with enough text for several chunks.";
    let resp = upload(&client, &base, "notes.txt", text).await;
    assert_eq!(resp.status(), 201);
    let created: Value = resp.json().await.unwrap();
    assert_eq!(created["status"], "pending");
    assert_eq!(created["original_filename"], "notes.txt");
    let id = created["id"].as_str().unwrap().to_string();

    let doc = wait_terminal(&client, &base, &id).await;
    assert_eq!(doc["status"], "completed");
    assert_eq!(doc["number_of_chunks"], 3);

    let chunks: Value = client
        .get(format!("{}/documents/{}/chunks", base, id))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let chunks = chunks["chunks"].as_array().unwrap();
    assert_eq!(chunks.len(), 3);
    assert_eq!(chunks[1]["start_offset"], 28);

    let download = client
        .get(format!("{}/documents/{}/download", base, id))
        .send()
        .await
        .unwrap();
    assert_eq!(download.status(), 200);
    assert_eq!(download.headers()["content-type"], "text/plain");
    assert_eq!(&download.bytes().await.unwrap()[..], &text[..]);

    let list: Value = client
        .get(format!("{}/documents?order=asc", base))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(list["documents"].as_array().unwrap().len(), 1);
}

#[tokio::test]
async fn unsupported_upload_is_accepted_and_fails() {
    let (_tmp, base) = start().await;
    let client = reqwest::Client::new();

    let resp = upload(&client, &base, "blob.xyz", b"data").await;
    assert_eq!(resp.status(), 201);
    let id = resp.json::<Value>().await.unwrap()["id"]
        .as_str()
        .unwrap()
        .to_string();

    let doc = wait_terminal(&client, &base, &id).await;
    assert_eq!(doc["status"], "failed");
    assert!(doc["error_message"]
        .as_str()
        .unwrap()
        .starts_with("UnsupportedFormat: "));

    // Re-triggering reports the same failure.
    let report: Value = client
        .post(format!("{}/documents/{}/ingest", base, id))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(report["outcome"], "failed");
    assert_eq!(report["kind"], "UnsupportedFormat");
}

#[tokio::test]
async fn oversize_upload_is_rejected() {
    let (_tmp, base) = start().await;
    let client = reqwest::Client::new();

    let resp = upload(&client, &base, "big.txt", &[b'a'; 2048]).await;
    assert_eq!(resp.status(), 400);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["error"]["code"], "bad_request");
}

#[tokio::test]
async fn missing_document_and_bad_query_errors() {
    let (_tmp, base) = start().await;
    let client = reqwest::Client::new();

    let resp = client
        .get(format!("{}/documents/does-not-exist", base))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 404);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["error"]["code"], "not_found");

    let resp = client
        .delete(format!("{}/documents/does-not-exist", base))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 404);

    let resp = client
        .post(format!("{}/query/retrieve-chunks", base))
        .json(&serde_json::json!({"query": "   "}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 400);

    let resp = client
        .post(format!("{}/query/ask", base))
        .json(&serde_json::json!({"query": "anything"}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 400);
}

#[tokio::test]
async fn delete_then_get_is_not_found() {
    let (_tmp, base) = start().await;
    let client = reqwest::Client::new();

    let resp = upload(&client, &base, "gone.md", b"# bye").await;
    let id = resp.json::<Value>().await.unwrap()["id"]
        .as_str()
        .unwrap()
        .to_string();
    wait_terminal(&client, &base, &id).await;

    let resp = client
        .delete(format!("{}/documents/{}", base, id))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 204);

    let resp = client
        .get(format!("{}/documents/{}", base, id))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 404);
}
