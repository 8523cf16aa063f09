//! ALIYUN driver against an in-process fake drive

mod common;

use std::collections::HashMap;
use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post, put};
use axum::{Json, Router};
use parking_lot::Mutex;
use serde_json::{json, Value};

use cloud_storage::{new_cloud_storage_client, Client, ErrorKind};

const MIB: u64 = 1024 * 1024;
/// The fake pages listings two entries at a time
const PAGE: usize = 2;

#[derive(Clone)]
struct Node {
    parent: String,
    name: String,
    is_dir: bool,
    size: u64,
    data: Vec<u8>,
    complete: bool,
}

#[derive(Default)]
struct Drive {
    base: String,
    nodes: HashMap<String, Node>,
    order: Vec<String>,
    next_id: usize,
    refreshes: usize,
    folder_creates: usize,
    file_creates: usize,
    part_puts: usize,
    completes: usize,
    download_urls: usize,
    fail_part: Option<u32>,
}

impl Drive {
    fn insert(&mut self, node: Node) -> String {
        self.next_id += 1;
        let id = format!("id{}", self.next_id);
        self.nodes.insert(id.clone(), node);
        self.order.push(id.clone());
        id
    }

    fn children(&self, parent: &str) -> Vec<(String, Node)> {
        self.order
            .iter()
            .filter_map(|id| self.nodes.get(id).map(|n| (id.clone(), n.clone())))
            .filter(|(_, n)| n.parent == parent && (n.is_dir || n.complete))
            .collect()
    }
}

type Shared = Arc<Mutex<Drive>>;

fn authorized(headers: &HeaderMap) -> bool {
    headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .map(|v| v.starts_with("Bearer at-"))
        .unwrap_or(false)
}

fn unauthorized() -> Response {
    (StatusCode::UNAUTHORIZED, Json(json!({"code": "AccessTokenInvalid"}))).into_response()
}

async fn refresh(State(drive): State<Shared>, Json(body): Json<Value>) -> Response {
    if body["refresh_token"] != "r0" && !body["refresh_token"].as_str().unwrap_or("").starts_with("r-") {
        return (StatusCode::BAD_REQUEST, Json(json!({"code": "InvalidParameter.RefreshToken"}))).into_response();
    }
    let mut drive = drive.lock();
    drive.refreshes += 1;
    let n = drive.refreshes;
    Json(json!({"access_token": format!("at-{}", n), "refresh_token": format!("r-{}", n), "expires_in": 7200}))
        .into_response()
}

async fn list(State(drive): State<Shared>, headers: HeaderMap, Json(body): Json<Value>) -> Response {
    if !authorized(&headers) {
        return unauthorized();
    }
    let drive = drive.lock();
    let parent = body["parent_file_id"].as_str().unwrap_or_default();
    let start: usize = body["marker"].as_str().and_then(|m| m.parse().ok()).unwrap_or(0);
    let all = drive.children(parent);
    let items: Vec<Value> = all
        .iter()
        .skip(start)
        .take(PAGE)
        .map(|(id, n)| {
            json!({
                "file_id": id,
                "name": n.name,
                "type": if n.is_dir { "folder" } else { "file" },
                "size": n.size,
            })
        })
        .collect();
    let next = if start + PAGE < all.len() { (start + PAGE).to_string() } else { String::new() };
    Json(json!({"items": items, "next_marker": next})).into_response()
}

async fn create_folder(State(drive): State<Shared>, headers: HeaderMap, Json(body): Json<Value>) -> Response {
    if !authorized(&headers) {
        return unauthorized();
    }
    let mut drive = drive.lock();
    drive.folder_creates += 1;
    let id = drive.insert(Node {
        parent: body["parent_file_id"].as_str().unwrap_or_default().to_string(),
        name: body["name"].as_str().unwrap_or_default().to_string(),
        is_dir: true,
        size: 0,
        data: Vec::new(),
        complete: true,
    });
    (StatusCode::CREATED, Json(json!({"file_id": id}))).into_response()
}

async fn create_file(State(drive): State<Shared>, headers: HeaderMap, Json(body): Json<Value>) -> Response {
    if !authorized(&headers) {
        return unauthorized();
    }
    let mut drive = drive.lock();
    drive.file_creates += 1;
    let id = drive.insert(Node {
        parent: body["parent_file_id"].as_str().unwrap_or_default().to_string(),
        name: body["name"].as_str().unwrap_or_default().to_string(),
        is_dir: false,
        size: body["size"].as_u64().unwrap_or(0),
        data: Vec::new(),
        complete: false,
    });
    let parts: Vec<Value> = body["part_info_list"]
        .as_array()
        .cloned()
        .unwrap_or_default()
        .iter()
        .map(|p| {
            let n = p["part_number"].as_u64().unwrap_or(0);
            json!({"part_number": n, "upload_url": format!("{}/upload/{}/{}", drive.base, id, n)})
        })
        .collect();
    (StatusCode::CREATED, Json(json!({"file_id": id, "upload_id": "up-1", "part_info_list": parts}))).into_response()
}

async fn upload_part(State(drive): State<Shared>, Path((id, part)): Path<(String, u32)>, body: Bytes) -> StatusCode {
    let mut drive = drive.lock();
    drive.part_puts += 1;
    if drive.fail_part == Some(part) {
        return StatusCode::INTERNAL_SERVER_ERROR;
    }
    match drive.nodes.get_mut(&id) {
        Some(node) => {
            node.data.extend_from_slice(&body);
            StatusCode::OK
        }
        None => StatusCode::NOT_FOUND,
    }
}

async fn complete(State(drive): State<Shared>, headers: HeaderMap, Json(body): Json<Value>) -> Response {
    if !authorized(&headers) {
        return unauthorized();
    }
    let mut drive = drive.lock();
    drive.completes += 1;
    let id = body["file_id"].as_str().unwrap_or_default().to_string();
    match drive.nodes.get_mut(&id) {
        Some(node) => {
            node.complete = true;
            Json(json!({"file_id": id})).into_response()
        }
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

async fn delete(State(drive): State<Shared>, headers: HeaderMap, Json(body): Json<Value>) -> Response {
    if !authorized(&headers) {
        return unauthorized();
    }
    let mut drive = drive.lock();
    let id = body["file_id"].as_str().unwrap_or_default().to_string();
    match drive.nodes.remove(&id) {
        Some(_) => StatusCode::NO_CONTENT.into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

async fn download_url(State(drive): State<Shared>, headers: HeaderMap, Json(body): Json<Value>) -> Response {
    if !authorized(&headers) {
        return unauthorized();
    }
    let mut drive = drive.lock();
    drive.download_urls += 1;
    let id = body["file_id"].as_str().unwrap_or_default();
    Json(json!({"url": format!("{}/download/{}", drive.base, id)})).into_response()
}

async fn download(State(drive): State<Shared>, Path(id): Path<String>, headers: HeaderMap) -> Response {
    if headers.get("referer").is_none() {
        return StatusCode::FORBIDDEN.into_response();
    }
    let drive = drive.lock();
    match drive.nodes.get(&id) {
        Some(node) => node.data.clone().into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

async fn fake_drive() -> Shared {
    let (listener, base) = common::bind().await;
    let drive = Arc::new(Mutex::new(Drive {
        base,
        ..Drive::default()
    }));
    let app = Router::new()
        .route("/token/refresh", post(refresh))
        .route("/adrive/v3/file/list", post(list))
        .route("/adrive/v2/file/createWithFolders", post(create_folder))
        .route("/v2/file/create", post(create_file))
        .route("/v2/file/complete", post(complete))
        .route("/v2/file/delete", post(delete))
        .route("/v2/file/get_download_url", post(download_url))
        .route("/upload/:id/:part", put(upload_part))
        .route("/download/:id", get(download))
        .with_state(drive.clone());
    common::serve(listener, app);
    drive
}

async fn client(drive: &Shared, part_size: u64) -> Client {
    let base = drive.lock().base.clone();
    let vars = common::vars(json!({
        "refresh_token": "r0",
        "drive_id": "drive-1",
        "api_url": base,
        "part_size": part_size,
    }));
    new_cloud_storage_client("ALIYUN", &vars).await.unwrap()
}

fn write_source(dir: &tempfile::TempDir, name: &str, len: usize) -> (std::path::PathBuf, Vec<u8>) {
    let path = dir.path().join(name);
    let data = common::payload(len);
    std::fs::write(&path, &data).unwrap();
    (path, data)
}

#[tokio::test]
async fn test_multipart_upload_and_round_trip() {
    let drive = fake_drive().await;
    let client = client(&drive, 4096).await;
    let scratch = tempfile::tempdir().unwrap();
    let (src, data) = write_source(&scratch, "a.bin", 4096 * 2 + 100);

    assert!(client.upload(&src, "backup/a.bin").await.unwrap());
    {
        let drive = drive.lock();
        assert_eq!(drive.file_creates, 1);
        assert_eq!(drive.part_puts, 3);
        assert_eq!(drive.completes, 1);
    }

    assert!(client.exist("backup/a.bin").await.unwrap());
    assert_eq!(client.size("/backup/a.bin").await.unwrap(), data.len() as u64);

    let out = scratch.path().join("restore/a.bin");
    assert!(client.download("backup/a.bin", &out).await.unwrap());
    assert_eq!(std::fs::read(&out).unwrap(), data);
}

#[tokio::test]
async fn test_failed_part_aborts_upload() {
    let drive = fake_drive().await;
    drive.lock().fail_part = Some(2);
    let client = client(&drive, 4096).await;
    let scratch = tempfile::tempdir().unwrap();
    let (src, _) = write_source(&scratch, "a.bin", 4096 * 2 + 100);

    let err = client.upload(&src, "a.bin").await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ProviderError);
    assert!(err.message().contains("HTTP 500"), "{}", err);
    assert!(err.message().contains("part 2"), "{}", err);

    let drive = drive.lock();
    assert_eq!(drive.part_puts, 2);
    assert_eq!(drive.completes, 0);
    // the placeholder file was deleted
    assert!(drive.nodes.values().all(|n| n.is_dir));
}

#[tokio::test]
async fn test_download_size_guard() {
    let drive = fake_drive().await;
    drive.lock().insert(Node {
        parent: "root".into(),
        name: "huge.tar".into(),
        is_dir: false,
        size: 120 * MIB,
        data: Vec::new(),
        complete: true,
    });
    let client = client(&drive, 4096).await;
    let scratch = tempfile::tempdir().unwrap();
    let out = scratch.path().join("huge.tar");

    let err = client.download("huge.tar", &out).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::SizeLimitExceeded);
    assert!(!out.exists());
    assert_eq!(drive.lock().download_urls, 0);
    assert_eq!(client.capabilities().max_download_size, Some(100 * MIB));
}

#[tokio::test]
async fn test_mkdir_p_reuses_existing_folders() {
    let drive = fake_drive().await;
    let scratch = tempfile::tempdir().unwrap();
    let (src, _) = write_source(&scratch, "x.txt", 10);

    let first = client(&drive, 4096).await;
    first.upload(&src, "a/b/c/x.txt").await.unwrap();
    assert_eq!(drive.lock().folder_creates, 3);

    // a fresh handle has no cached IDs and must find the folders by listing
    let second = client(&drive, 4096).await;
    second.upload(&src, "a/b/c/x.txt").await.unwrap();
    assert_eq!(drive.lock().folder_creates, 3);
    assert_eq!(drive.lock().file_creates, 2);
}

#[tokio::test]
async fn test_delete_missing_and_listing_pagination() {
    let drive = fake_drive().await;
    let client = client(&drive, 4096).await;
    let scratch = tempfile::tempdir().unwrap();

    assert!(client.delete("never/existed").await.unwrap());
    assert!(client.list_objects("never").await.unwrap().is_empty());

    for i in 0..5 {
        let (src, _) = write_source(&scratch, &format!("f{}.bin", i), 8);
        client.upload(&src, &format!("many/f{}.bin", i)).await.unwrap();
    }
    let mut names = client.list_objects("many").await.unwrap();
    names.sort();
    assert_eq!(names, vec!["f0.bin", "f1.bin", "f2.bin", "f3.bin", "f4.bin"]);

    assert!(client.delete("many/f3.bin").await.unwrap());
    assert!(!client.exist("many/f3.bin").await.unwrap());
    assert!(client.delete("many/f3.bin").await.unwrap());
}

#[tokio::test]
async fn test_refresh_token_rotates() {
    let drive = fake_drive().await;
    let base = drive.lock().base.clone();
    let vars = common::vars(json!({"refresh_token": "r0", "drive_id": "drive-1", "api_url": base}));

    let rotated = cloud_storage::refresh_token("ALIYUN", &vars).await.unwrap();
    assert_eq!(rotated, "r-1");

    let bad = common::vars(json!({"refresh_token": "bogus", "drive_id": "drive-1", "api_url": base}));
    let err = new_cloud_storage_client("ALIYUN", &bad).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::AuthFailure);
}
