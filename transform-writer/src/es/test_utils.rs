use axum::Router;
use serde_json::{Value, json};
use tokio::net::TcpListener;

use crate::record::Record;

/// Serves `app` on an ephemeral local port and returns its base URL.
pub(crate) async fn start_server(app: Router) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{addr}")
}

/// `n` records with string ids `"0"`, `"1"`, ... and no `appCode` or `createDate`.
pub(crate) fn records(n: usize) -> Vec<Record> {
    (0..n)
        .map(|i| match json!({"id": i.to_string(), "title": format!("title {i}")}) {
            Value::Object(map) => map,
            _ => unreachable!(),
        })
        .collect()
}
