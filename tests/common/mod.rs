//! Shared helpers for the fake provider servers

#![allow(dead_code)]

use axum::Router;
use serde_json::{Map, Value};
use tokio::net::TcpListener;

/// Bind `127.0.0.1:0` and return the base URL before the router is built
pub async fn bind() -> (TcpListener, String) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let base = format!("http://{}", listener.local_addr().unwrap());
    (listener, base)
}

pub fn serve(listener: TcpListener, app: Router) {
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
}

pub fn vars(value: Value) -> Map<String, Value> {
    value.as_object().cloned().unwrap()
}

/// Deterministic file body of `len` bytes
pub fn payload(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}
