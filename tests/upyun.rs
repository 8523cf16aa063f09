//! UPYUN driver against an in-process fake REST API

mod common;

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::{DefaultBodyLimit, State};
use axum::http::{HeaderMap, Method, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::{Json, Router};
use base64::Engine;
use hmac::{Hmac, Mac};
use parking_lot::Mutex;
use serde_json::{json, Value};
use sha1::Sha1;

use cloud_storage::{new_cloud_storage_client, Client, ErrorKind};

const MIB: usize = 1024 * 1024;
/// Resumable uploads kick in above 10 MiB
const PART: usize = 10 * MIB;
const LIST_END: &str = "g2gCZAAEbmV4dGQAA2VvZg";
/// The fake pages listings two entries at a time
const PAGE: usize = 2;

#[derive(Default)]
struct Bucket {
    /// Decoded key below `/backup/`
    files: BTreeMap<String, Vec<u8>>,
    declared: usize,
    parts: Vec<Vec<u8>>,
    single_puts: usize,
    initiates: usize,
    completes: usize,
    list_pages: usize,
    fail_part: Option<usize>,
}

type Shared = Arc<Mutex<Bucket>>;

fn header<'a>(headers: &'a HeaderMap, name: &str) -> &'a str {
    headers.get(name).and_then(|v| v.to_str().ok()).unwrap_or_default()
}

/// Recompute `UPYUN op:sign` for operator `op` with password `pw`
fn signed(method: &Method, uri: &Uri, headers: &HeaderMap) -> bool {
    let key = format!("{:x}", md5::compute(b"pw"));
    let data = format!("{}&{}&{}", method, uri.path(), header(headers, "date"));
    let mut mac = Hmac::<Sha1>::new_from_slice(key.as_bytes()).unwrap();
    mac.update(data.as_bytes());
    let expected = base64::engine::general_purpose::STANDARD.encode(mac.finalize().into_bytes());
    header(headers, "authorization") == format!("UPYUN op:{}", expected)
}

/// Files and implied folders directly below `dir`
fn entries(bucket: &Bucket, dir: &str) -> Vec<String> {
    let names: BTreeSet<String> = bucket
        .files
        .keys()
        .filter_map(|k| k.strip_prefix(dir))
        .map(|rest| rest.split('/').next().unwrap_or_default().to_string())
        .collect();
    names.into_iter().collect()
}

async fn api(State(bucket): State<Shared>, method: Method, uri: Uri, headers: HeaderMap, body: Bytes) -> Response {
    if !signed(&method, &uri, &headers) {
        return (StatusCode::UNAUTHORIZED, Json(json!({"msg": "sign error", "code": 40100005}))).into_response();
    }
    let path = urlencoding::decode(uri.path()).unwrap().into_owned();
    let Some(key) = path.strip_prefix("/backup/").map(str::to_string) else {
        return StatusCode::NOT_FOUND.into_response();
    };
    let mut bucket = bucket.lock();
    match method {
        Method::GET if key.is_empty() || key.ends_with('/') => {
            assert_eq!(header(&headers, "accept"), "application/json");
            bucket.list_pages += 1;
            let all = entries(&bucket, &key);
            let start: usize = header(&headers, "x-list-iter").parse().unwrap_or(0);
            let files: Vec<Value> = all
                .iter()
                .skip(start)
                .take(PAGE)
                .map(|name| json!({"name": name, "type": "N", "length": 0}))
                .collect();
            let iter = if start + PAGE < all.len() { (start + PAGE).to_string() } else { LIST_END.to_string() };
            Json(json!({"files": files, "iter": iter})).into_response()
        }
        Method::GET => match bucket.files.get(&key) {
            Some(data) => data.clone().into_response(),
            None => StatusCode::NOT_FOUND.into_response(),
        },
        Method::HEAD => match bucket.files.get(&key) {
            Some(data) => (StatusCode::OK, [("x-upyun-file-size", data.len().to_string())]).into_response(),
            None => StatusCode::NOT_FOUND.into_response(),
        },
        Method::DELETE => match bucket.files.remove(&key) {
            Some(_) => StatusCode::OK.into_response(),
            None => StatusCode::NOT_FOUND.into_response(),
        },
        Method::PUT => match header(&headers, "x-upyun-multi-stage") {
            "" => {
                bucket.single_puts += 1;
                bucket.files.insert(key, body.to_vec());
                StatusCode::OK.into_response()
            }
            "initiate" => {
                bucket.initiates += 1;
                bucket.declared = header(&headers, "x-upyun-multi-length").parse().unwrap();
                bucket.parts.clear();
                (StatusCode::NO_CONTENT, [("x-upyun-multi-uuid", "u1")]).into_response()
            }
            "upload" => {
                assert_eq!(header(&headers, "x-upyun-multi-uuid"), "u1");
                let id: usize = header(&headers, "x-upyun-part-id").parse().unwrap();
                assert_eq!(id, bucket.parts.len());
                if bucket.fail_part == Some(id) {
                    return (StatusCode::INTERNAL_SERVER_ERROR, "part rejected").into_response();
                }
                bucket.parts.push(body.to_vec());
                StatusCode::NO_CONTENT.into_response()
            }
            "complete" => {
                let data = bucket.parts.concat();
                if data.len() != bucket.declared {
                    return (StatusCode::BAD_REQUEST, "length mismatch").into_response();
                }
                bucket.completes += 1;
                bucket.files.insert(key, data);
                StatusCode::NO_CONTENT.into_response()
            }
            _ => StatusCode::BAD_REQUEST.into_response(),
        },
        _ => StatusCode::METHOD_NOT_ALLOWED.into_response(),
    }
}

async fn fake_bucket() -> (Shared, String) {
    let (listener, base) = common::bind().await;
    let state = Arc::new(Mutex::new(Bucket::default()));
    let app = Router::new()
        .fallback(api)
        .layer(DefaultBodyLimit::disable())
        .with_state(state.clone());
    common::serve(listener, app);
    (state, base)
}

async fn client(base: &str, password: &str) -> Client {
    let vars = common::vars(json!({
        "operator": "op",
        "password": password,
        "bucket": "backup",
        "api_url": base,
    }));
    new_cloud_storage_client("UPYUN", &vars).await.unwrap()
}

fn write_source(dir: &tempfile::TempDir, name: &str, len: usize) -> (std::path::PathBuf, Vec<u8>) {
    let path = dir.path().join(name);
    let data = common::payload(len);
    std::fs::write(&path, &data).unwrap();
    (path, data)
}

#[tokio::test]
async fn test_single_put_round_trip() {
    let (bucket, base) = fake_bucket().await;
    let client = client(&base, "pw").await;
    let scratch = tempfile::tempdir().unwrap();
    let (src, data) = write_source(&scratch, "db.sql", 5000);

    assert!(client.upload(&src, "db/2024 01.sql").await.unwrap());
    assert_eq!(bucket.lock().single_puts, 1);

    assert!(client.exist("db/2024 01.sql").await.unwrap());
    assert_eq!(client.size("db/2024 01.sql").await.unwrap(), 5000);
    assert_eq!(client.list_objects("db").await.unwrap(), vec!["2024 01.sql".to_string()]);

    let out = scratch.path().join("restore/db.sql");
    assert!(client.download("db/2024 01.sql", &out).await.unwrap());
    assert_eq!(std::fs::read(&out).unwrap(), data);

    assert!(client.delete("db/2024 01.sql").await.unwrap());
    assert!(!client.exist("db/2024 01.sql").await.unwrap());
    assert!(client.delete("db/2024 01.sql").await.unwrap());
}

#[tokio::test]
async fn test_large_file_uses_multi_stage_upload() {
    let (bucket, base) = fake_bucket().await;
    let client = client(&base, "pw").await;
    let scratch = tempfile::tempdir().unwrap();
    let (src, data) = write_source(&scratch, "big.tar", PART + 100);

    assert!(client.upload(&src, "big.tar").await.unwrap());
    {
        let bucket = bucket.lock();
        assert_eq!(bucket.single_puts, 0);
        assert_eq!(bucket.initiates, 1);
        assert_eq!(bucket.parts.len(), 2);
        assert_eq!(bucket.parts[1].len(), 100);
        assert_eq!(bucket.completes, 1);
        assert_eq!(bucket.files["big.tar"], data);
    }
    assert_eq!(client.size("big.tar").await.unwrap(), data.len() as u64);
}

#[tokio::test]
async fn test_failed_stage_is_not_completed() {
    let (bucket, base) = fake_bucket().await;
    bucket.lock().fail_part = Some(1);
    let client = client(&base, "pw").await;
    let scratch = tempfile::tempdir().unwrap();
    let (src, _) = write_source(&scratch, "big.tar", PART + 100);

    let err = client.upload(&src, "big.tar").await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ProviderError);
    assert!(err.message().contains("upload part 2"), "{}", err);
    assert!(err.message().contains("HTTP 500"), "{}", err);

    let bucket = bucket.lock();
    assert_eq!(bucket.completes, 0);
    assert!(bucket.files.is_empty());
}

#[tokio::test]
async fn test_listing_follows_iter_marker() {
    let (bucket, base) = fake_bucket().await;
    let client = client(&base, "pw").await;
    let scratch = tempfile::tempdir().unwrap();
    for i in 0..5 {
        let (src, _) = write_source(&scratch, &format!("f{}.bin", i), 8);
        client.upload(&src, &format!("many/f{}.bin", i)).await.unwrap();
    }
    let (src, _) = write_source(&scratch, "nested.bin", 8);
    client.upload(&src, "many/sub/nested.bin").await.unwrap();

    let names = client.list_objects("many").await.unwrap();
    assert_eq!(names, vec!["f0.bin", "f1.bin", "f2.bin", "f3.bin", "f4.bin", "sub"]);
    assert_eq!(bucket.lock().list_pages, 3);
    assert_eq!(client.list_objects("").await.unwrap(), vec!["many".to_string()]);
}

#[tokio::test]
async fn test_bad_signature_is_auth_failure() {
    let (_, base) = fake_bucket().await;
    let client = client(&base, "not-the-password").await;
    let err = client.exist("a.bin").await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::AuthFailure);
}
