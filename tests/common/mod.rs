#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::http::header;
use axum::routing::get;
use axum::Router;
use file_lifecycle::config::{
    Config, DownloadConfig, NodeConfig, StorageConfig, StoreConfig, TransferConfig, UploadConfig,
};
use file_lifecycle::object_store::StoreSet;
use file_lifecycle::storage::Database;
use file_lifecycle::transfer::HttpFetcher;
use file_lifecycle::uploads::allow_content_types;
use file_lifecycle::{api, AppState};
use serde_json::Value;

pub const CAT_PNG: &[u8] = b"\x89PNG\r\n\x1a\nnot really a cat";

pub struct TestApp {
    pub base_url: String,
    pub client: reqwest::Client,
    pub origin_url: String,
    pub state: Arc<AppState>,
    _dir: tempfile::TempDir,
}

impl TestApp {
    pub fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    pub async fn call(&self, method: &str, params: Value) -> reqwest::Response {
        self.client
            .post(self.url(&format!("/methods/{method}")))
            .json(&params)
            .send()
            .await
            .unwrap()
    }

    /// Poll a record until its state matches and no store entry is still
    /// moving, or give up after five seconds.
    pub async fn wait_for_state(&self, id: &str, expected: &str) -> Value {
        let mut last = Value::Null;
        for _ in 0..250 {
            let resp = self
                .client
                .get(self.url(&format!("/records/{id}")))
                .send()
                .await
                .unwrap();
            last = resp.json().await.unwrap();
            let settled = last["data"]["stores"]
                .as_array()
                .is_some_and(|stores| {
                    stores
                        .iter()
                        .all(|e| e["status"] == "complete" || e["status"] == "failed")
                });
            if last["data"]["state"] == expected && settled {
                return last;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("record {id} never reached {expected}: {last}");
    }
}

pub fn test_config(dir: &tempfile::TempDir) -> Config {
    let path = |p: &str| dir.path().join(p).to_string_lossy().to_string();
    let mirror = StoreConfig {
        required: false,
        ..StoreConfig::local("mirror", &path("mirror"))
    };

    Config {
        downloads: DownloadConfig::default(),
        node: NodeConfig {
            bind_address: "127.0.0.1:0".to_string(),
            data_dir: path("data"),
        },
        storage: StorageConfig {
            stores: vec![StoreConfig::local("primary", &path("primary")), mirror],
        },
        transfer: TransferConfig {
            max_attempts: 2,
            initial_backoff: Duration::from_millis(5),
            max_backoff: Duration::from_millis(10),
            fetch_timeout: Duration::from_secs(5),
        },
        uploads: UploadConfig {
            temp_dir: path("uploads"),
            ..UploadConfig::default()
        },
        test_mode: true,
        max_upload_size: 10 * 1024 * 1024,
    }
}

/// Serve a fixed set of files, standing in for a remote image host.
pub async fn spawn_origin() -> String {
    let app = Router::new()
        .route(
            "/images/cat.png",
            get(|| async { ([(header::CONTENT_TYPE, "image/png")], CAT_PNG) }),
        )
        .route(
            "/images/broken.png",
            get(|| async { axum::http::StatusCode::INTERNAL_SERVER_ERROR }),
        );
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr: SocketAddr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{addr}")
}

pub async fn spawn_app() -> TestApp {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(&dir);

    let db = Database::open(&config.node.data_dir).unwrap();
    let stores = StoreSet::from_config(&config.storage.stores).unwrap();
    let fetcher = HttpFetcher::new(config.transfer.fetch_timeout, config.max_upload_size).unwrap();
    let admission = allow_content_types(config.uploads.allowed_types.clone());

    let (state, upload_events) =
        AppState::new(config, db, stores, Arc::new(fetcher), admission).unwrap();
    state.pool.start(upload_events).unwrap();

    let app = api::create_router(Arc::clone(&state));
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    TestApp {
        base_url: format!("http://{addr}"),
        client: reqwest::Client::new(),
        origin_url: spawn_origin().await,
        state,
        _dir: dir,
    }
}
