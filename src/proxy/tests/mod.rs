
use axum::{
    body::Body,
    extract::State,
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use bytes::Bytes;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::modules::persistence::store::Store;
use crate::modules::system::config::AppConfig;
use crate::proxy::state::AppState;
use crate::proxy::upstream::client::UpstreamClient;

pub(crate) type ChatResponder = Arc<dyn Fn(&str, usize) -> Response + Send + Sync>;
pub(crate) type InfoResponder = Arc<dyn Fn(&str) -> Response + Send + Sync>;

/// Scripted stand-in for the upstream API. The chat responder sees the
/// bearer secret and the zero-based hit number; the info responder sees the
/// secret.
#[derive(Clone)]
pub(crate) struct MockUpstream {
    pub chat_hits: Arc<AtomicUsize>,
    chat: ChatResponder,
    info: InfoResponder,
}

fn bearer_secret(headers: &HeaderMap) -> String {
    headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.strip_prefix("Bearer "))
        .unwrap_or("")
        .to_string()
}

async fn mock_chat(State(mock): State<MockUpstream>, headers: HeaderMap, _body: Bytes) -> Response {
    let hit = mock.chat_hits.fetch_add(1, Ordering::SeqCst);
    (mock.chat)(&bearer_secret(&headers), hit)
}

async fn mock_info(State(mock): State<MockUpstream>, headers: HeaderMap) -> Response {
    (mock.info)(&bearer_secret(&headers))
}

impl MockUpstream {
    pub fn new(chat: ChatResponder, info: InfoResponder) -> Self {
        Self {
            chat_hits: Arc::new(AtomicUsize::new(0)),
            chat,
            info,
        }
    }

    /// Binds the mock on an ephemeral port; returns its `/v1` base URL.
    pub async fn serve(self) -> (String, tokio::task::JoinHandle<()>) {
        let app = Router::new()
            .route("/v1/chat/completions", post(mock_chat))
            .route("/v1/user/info", get(mock_info))
            .with_state(self);
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind mock upstream");
        let addr = listener.local_addr().expect("local addr");
        let handle = tokio::spawn(async move {
            axum::serve(listener, app).await.expect("serve mock upstream");
        });
        (format!("http://{}/v1", addr), handle)
    }
}

/// Balance responder speaking the documented envelope.
pub(crate) fn balance_info(balance_for: impl Fn(&str) -> f64 + Send + Sync + 'static) -> InfoResponder {
    Arc::new(move |secret| {
        Json(serde_json::json!({
            "code": 20000,
            "message": "OK",
            "status": true,
            "data": {"balance": balance_for(secret).to_string()}
        }))
        .into_response()
    })
}

pub(crate) fn json_chat_ok(body: serde_json::Value) -> ChatResponder {
    Arc::new(move |_, _| Json(body.clone()).into_response())
}

pub(crate) fn sse_chat_ok(chunks: &'static [&'static str]) -> ChatResponder {
    Arc::new(move |_, _| {
        let stream = futures::stream::iter(
            chunks
                .iter()
                .map(|c| Ok::<Bytes, std::convert::Infallible>(Bytes::from_static(c.as_bytes()))),
        );
        Response::builder()
            .status(StatusCode::OK)
            .header("Content-Type", "text/event-stream")
            .body(Body::from_stream(stream))
            .expect("sse response")
    })
}

pub(crate) struct Harness {
    pub _data_dir: tempfile::TempDir,
    pub state: AppState,
    pub mock: MockUpstream,
    pub _mock_handle: tokio::task::JoinHandle<()>,
}

/// Full application state wired to a mock upstream, with the retry wait
/// shrunk so failure paths run in milliseconds.
pub(crate) async fn harness(chat: ChatResponder, info: InfoResponder) -> Harness {
    harness_with_config(chat, info, AppConfig::default()).await
}

pub(crate) async fn harness_with_config(
    chat: ChatResponder,
    info: InfoResponder,
    mut config: AppConfig,
) -> Harness {
    let mock = MockUpstream::new(chat, info);
    let (base_url, mock_handle) = mock.clone().serve().await;

    let data_dir = tempfile::tempdir().expect("tempdir");
    config.data_dir = data_dir.path().to_path_buf();
    config.upstream_timeout = Duration::from_secs(5);
    let store = Store::new(data_dir.path()).expect("store");
    let upstream = Arc::new(UpstreamClient::with_base_url(base_url, config.upstream_timeout));

    let state = AppState::assemble(Arc::new(config), store, upstream)
        .expect("state")
        .tune_engine_waits(Duration::from_millis(20), Duration::from_millis(5));

    Harness {
        _data_dir: data_dir,
        state,
        mock,
        _mock_handle: mock_handle,
    }
}

impl Harness {
    /// Serves the full router on an ephemeral port for tests that need a
    /// real client socket (streaming, disconnects, auth).
    pub async fn serve_router(&self) -> (String, tokio::task::JoinHandle<()>) {
        let app = crate::proxy::server::build_router(self.state.clone());
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind relay");
        let addr = listener.local_addr().expect("local addr");
        let handle = tokio::spawn(async move {
            axum::serve(listener, app).await.expect("serve relay");
        });
        (format!("http://{}", addr), handle)
    }

    pub fn seed_key(&self, secret: &str) -> i64 {
        let id = self.state.store.add_credential(secret).expect("seed key");
        self.state.selector.mark_dirty();
        id
    }
}

pub(crate) async fn response_json(response: Response) -> serde_json::Value {
    let bytes = axum::body::to_bytes(response.into_body(), 10 * 1024 * 1024)
        .await
        .expect("read body");
    serde_json::from_slice(&bytes).expect("parse body")
}
