//! Contract properties checked against the LOCAL provider

mod common;

use cloud_storage::{new_cloud_storage_client, Client, ErrorKind};
use serde_json::json;

async fn local_client(root: &std::path::Path) -> Client {
    new_cloud_storage_client("LOCAL", &common::vars(json!({ "path": root })))
        .await
        .unwrap()
}

#[tokio::test]
async fn test_round_trip_preserves_bytes() {
    let remote = tempfile::tempdir().unwrap();
    let scratch = tempfile::tempdir().unwrap();
    let client = local_client(remote.path()).await;

    let src = scratch.path().join("a.bin");
    let data = common::payload(3 * 1024 * 1024 + 17);
    std::fs::write(&src, &data).unwrap();

    assert!(client.upload(&src, "dir/sub/a.bin").await.unwrap());
    assert_eq!(client.size("dir/sub/a.bin").await.unwrap(), data.len() as u64);
    assert_eq!(client.list_objects("dir").await.unwrap(), vec!["sub".to_string()]);

    let dst = scratch.path().join("nested/out/a.bin");
    assert!(client.download("dir/sub/a.bin", &dst).await.unwrap());
    assert_eq!(std::fs::read(&dst).unwrap(), data);
}

#[tokio::test]
async fn test_delete_is_idempotent() {
    let remote = tempfile::tempdir().unwrap();
    let scratch = tempfile::tempdir().unwrap();
    let client = local_client(remote.path()).await;

    let src = scratch.path().join("x.txt");
    std::fs::write(&src, b"hello").unwrap();
    client.upload(&src, "x.txt").await.unwrap();

    assert!(client.delete("x.txt").await.unwrap());
    assert!(client.delete("x.txt").await.unwrap());
    assert!(client.delete("never/existed").await.unwrap());
}

#[tokio::test]
async fn test_exist_follows_upload_and_delete() {
    let remote = tempfile::tempdir().unwrap();
    let scratch = tempfile::tempdir().unwrap();
    let client = local_client(remote.path()).await;

    let src = scratch.path().join("f.dat");
    std::fs::write(&src, b"payload").unwrap();

    assert!(!client.exist("a/f.dat").await.unwrap());
    client.upload(&src, "a/f.dat").await.unwrap();
    assert!(client.exist("a/f.dat").await.unwrap());
    client.delete("a/f.dat").await.unwrap();
    assert!(!client.exist("a/f.dat").await.unwrap());
}

#[tokio::test]
async fn test_path_normalization() {
    let remote = tempfile::tempdir().unwrap();
    let scratch = tempfile::tempdir().unwrap();
    let client = local_client(remote.path()).await;

    let src = scratch.path().join("b");
    std::fs::write(&src, b"b").unwrap();
    client.upload(&src, "a/b").await.unwrap();

    assert_eq!(client.exist("/a/b").await.unwrap(), client.exist("a/b").await.unwrap());
    assert!(client.exist("//a/./b").await.unwrap());

    let err = client.exist("a/../b").await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidPath);
}

#[tokio::test]
async fn test_missing_prefix_lists_empty_and_size_fails() {
    let remote = tempfile::tempdir().unwrap();
    let client = local_client(remote.path()).await;

    assert!(client.list_objects("nothing/here").await.unwrap().is_empty());
    let err = client.size("nothing/here.bin").await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);
}

#[tokio::test]
async fn test_failed_download_leaves_no_file() {
    let remote = tempfile::tempdir().unwrap();
    let scratch = tempfile::tempdir().unwrap();
    let client = local_client(remote.path()).await;

    let dst = scratch.path().join("out.bin");
    let err = client.download("missing.bin", &dst).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);
    assert!(!dst.exists());
}

#[tokio::test]
async fn test_upload_to_root_is_rejected() {
    let remote = tempfile::tempdir().unwrap();
    let scratch = tempfile::tempdir().unwrap();
    let client = local_client(remote.path()).await;

    let src = scratch.path().join("f");
    std::fs::write(&src, b"f").unwrap();
    let err = client.upload(&src, "/").await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidPath);
}

#[tokio::test]
async fn test_failed_download_keeps_existing_destination() {
    let remote = tempfile::tempdir().unwrap();
    let scratch = tempfile::tempdir().unwrap();
    let client = local_client(remote.path()).await;
    std::fs::create_dir(remote.path().join("folder")).unwrap();

    let dst = scratch.path().join("out.bin");
    std::fs::write(&dst, b"keep me").unwrap();
    assert!(client.download("folder", &dst).await.is_err());
    assert_eq!(std::fs::read(&dst).unwrap(), b"keep me");
    assert!(!scratch.path().join("out.bin.part").exists());
}

#[tokio::test]
async fn test_uploading_a_stored_file_onto_itself() {
    let remote = tempfile::tempdir().unwrap();
    let client = local_client(remote.path()).await;
    let stored = remote.path().join("a.bin");
    let data = common::payload(4096);
    std::fs::write(&stored, &data).unwrap();

    let err = client.upload(&stored, "a.bin").await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidPath);
    assert_eq!(std::fs::read(&stored).unwrap(), data);
}

#[tokio::test]
async fn test_paths_below_a_file_count_as_missing() {
    let remote = tempfile::tempdir().unwrap();
    let client = local_client(remote.path()).await;
    std::fs::write(remote.path().join("never"), b"file").unwrap();

    assert!(!client.exist("never/existed").await.unwrap());
    assert!(client.delete("never/existed").await.unwrap());
    assert_eq!(client.size("never/existed").await.unwrap_err().kind(), ErrorKind::NotFound);
    assert!(client.list_objects("never").await.unwrap().is_empty());
}
