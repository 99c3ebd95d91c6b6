use crate::AppState;
use crate::config::max_wait_secs;
use crate::remote::RemoteOutcome;
use crate::torrserver::has_file_stats;
use crate::validation::{extract_hash, parse_index};
use anyhow::Context;
use axum::{
    Json, Router,
    extract::{Query, Request, State},
    handler::HandlerWithoutStateExt,
    http::{Method, StatusCode, header},
    middleware::{self, Next},
    response::{Html, IntoResponse, Response},
    routing::get,
};
use serde::Deserialize;
use serde_json::{Value, json};
use tower_http::cors::{Any, CorsLayer};
use tower_http::services::ServeDir;

const DEFAULT_INDEX: &str = "1";

pub fn router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::OPTIONS])
        .allow_headers([header::CONTENT_TYPE]);

    Router::new()
        .route("/health", get(health))
        .route("/api/ffprobe", get(ffprobe_direct))
        .route("/api/ffprobe-auto", get(ffprobe_auto))
        .fallback_service(
            ServeDir::new(&state.config.static_dir).not_found_service(not_found.into_service()),
        )
        .layer(middleware::from_fn(reject_traversal))
        .layer(cors)
        .with_state(state)
}

pub async fn serve(state: AppState, addr: std::net::SocketAddr) -> anyhow::Result<()> {
    let app = router(state);
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("bind {addr}"))?;
    tracing::info!(%addr, "listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    tracing::info!("server closed");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            tracing::warn!(%err, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(err) => {
                tracing::warn!(%err, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    tracing::info!("shutting down");
}

async fn not_found() -> impl IntoResponse {
    (StatusCode::NOT_FOUND, Html("<h1>404 - File Not Found</h1>"))
}

async fn reject_traversal(req: Request, next: Next) -> Response {
    if escapes_root(req.uri().path()) {
        tracing::warn!(path = req.uri().path(), "web: path traversal rejected");
        return RemoteOutcome::error(403, "Forbidden").into_response();
    }
    next.run(req).await
}

/// Whether a request path has a `..` segment, including percent-encoded forms.
fn escapes_root(path: &str) -> bool {
    let decoded = path
        .to_ascii_lowercase()
        .replace("%2e", ".")
        .replace("%2f", "/")
        .replace("%5c", "/")
        .replace('\\', "/");
    decoded.split('/').any(|segment| segment == "..")
}

impl IntoResponse for RemoteOutcome {
    fn into_response(self) -> Response {
        let status = StatusCode::from_u16(self.status).unwrap_or(StatusCode::BAD_GATEWAY);
        (status, [(header::CONTENT_TYPE, "application/json")], self.body).into_response()
    }
}

async fn health(State(state): State<AppState>) -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "timestamp": chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true),
        "waiting": state.waiter.in_flight(),
    }))
}

#[derive(Deserialize)]
struct ProbeParams {
    hash: Option<String>,
    index: Option<String>,
    title: Option<String>,
}

struct ProbeRequest {
    hash: String,
    index: u64,
    title: String,
}

impl ProbeParams {
    fn validate(self, route: &'static str) -> Result<ProbeRequest, Response> {
        let raw_hash = self.hash.unwrap_or_default();
        let index = self
            .index
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| DEFAULT_INDEX.to_string());
        let Some(index) = parse_index(&index) else {
            return Err(RemoteOutcome::error(
                400,
                "Invalid index: must be a non-negative integer",
            )
            .into_response());
        };

        let prefix: String = raw_hash.chars().take(8).collect();
        tracing::info!(route, hash = %prefix, index, "api: ffprobe request");

        let hash = extract_hash(&raw_hash);
        if hash.is_empty() {
            return Err(
                RemoteOutcome::error(400, "Hash is required or invalid magnet link").into_response(),
            );
        }

        Ok(ProbeRequest {
            hash,
            index,
            title: self.title.unwrap_or_default(),
        })
    }
}

async fn ffprobe_direct(
    State(state): State<AppState>,
    Query(params): Query<ProbeParams>,
) -> Response {
    let req = match params.validate("direct") {
        Ok(req) => req,
        Err(resp) => return resp,
    };

    let outcome = state.torrserver.media_info(&req.hash, req.index).await;
    relay_probe(&state, outcome)
}

async fn ffprobe_auto(State(state): State<AppState>, Query(params): Query<ProbeParams>) -> Response {
    let req = match params.validate("auto") {
        Ok(req) => req,
        Err(resp) => return resp,
    };

    let (exists, _) = state.torrserver.exists(&req.hash).await;
    if exists {
        tracing::info!(hash = %req.hash, "api: torrent found; probing");
        let outcome = state.torrserver.media_info(&req.hash, req.index).await;
        return relay_probe(&state, outcome);
    }

    let (added, result) = state.torrserver.add(&req.hash, &req.title).await;
    if !added {
        tracing::warn!(hash = %req.hash, "api: failed to add torrent");
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({
                "error": "Failed to add torrent to TorrServer",
                "hash": req.hash,
                "details": "Check if hash is valid and TorrServer is accessible",
            })),
        )
            .into_response();
    }

    if result.as_ref().is_some_and(has_file_stats) {
        tracing::info!(hash = %req.hash, "api: torrent added with metadata; probing");
        let outcome = state.torrserver.media_info(&req.hash, req.index).await;
        return relay_probe(&state, outcome);
    }

    let defaults = state.waiter.defaults();
    tracing::info!(
        hash = %req.hash,
        max_wait_secs = max_wait_secs(defaults.max_attempts, defaults.interval.as_millis() as u64),
        "api: waiting for metadata"
    );
    let outcome = state.waiter.probe_when_ready(&req.hash, req.index, None).await;
    relay_probe(&state, outcome)
}

/// Maps a media probe outcome to the response sent to the browser.
fn relay_probe(state: &AppState, outcome: RemoteOutcome) -> Response {
    match outcome.status {
        200 => match outcome.json() {
            Ok(doc) => {
                let streams = doc
                    .get("streams")
                    .and_then(Value::as_array)
                    .map_or(0, Vec::len);
                tracing::info!(streams, "api: probe received");
                outcome.into_response()
            }
            Err(err) => {
                tracing::warn!(%err, "api: probe response is not JSON");
                RemoteOutcome::error(500, "Failed to parse response").into_response()
            }
        },
        401 => {
            tracing::warn!("api: TorrServer authentication failed");
            RemoteOutcome::error(401, "Authentication failed. Check server credentials.")
                .into_response()
        }
        408 => {
            tracing::warn!(
                max_wait_secs = max_wait_secs(
                    state.config.metadata_max_attempts,
                    state.config.metadata_attempt_delay_ms
                ),
                "api: metadata not loaded in time"
            );
            outcome.into_response()
        }
        504 => {
            tracing::warn!("api: TorrServer request timeout");
            outcome.into_response()
        }
        status => {
            tracing::warn!(status, "api: probe failed");
            outcome.into_response()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use httpmock::Method::{GET, POST};
    use httpmock::MockServer;
    use std::path::PathBuf;
    use std::time::{SystemTime, UNIX_EPOCH};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    const HASH: &str = "0123456789abcdef0123456789abcdef01234567";

    fn test_config(torrserver_url: String, static_dir: PathBuf) -> Config {
        Config {
            http_addr: None,
            http_port: 0,
            static_dir,
            torrserver_url,
            torrserver_username: String::new(),
            torrserver_password: String::new(),
            request_timeout_ms: 2_000,
            response_max_bytes: 64 * 1024,
            metadata_max_attempts: 2,
            metadata_attempt_delay_ms: 50,
            metadata_settle_ms: 1,
        }
    }

    fn temp_static_dir() -> PathBuf {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_nanos();
        let dir = std::env::temp_dir().join(format!(
            "lampa-tracks-static-{}-{}",
            std::process::id(),
            nanos
        ));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    async fn spawn_app(torrserver_url: String, static_dir: PathBuf) -> String {
        let state = AppState::new(test_config(torrserver_url, static_dir)).unwrap();
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router(state)).await.unwrap();
        });
        format!("http://{addr}")
    }

    async fn get_json(url: &str) -> (u16, Value) {
        let resp = reqwest::get(url).await.unwrap();
        let status = resp.status().as_u16();
        let body = resp.json::<Value>().await.unwrap();
        (status, body)
    }

    #[tokio::test]
    async fn health_reports_ok() {
        let app = spawn_app("http://127.0.0.1:9".into(), temp_static_dir()).await;
        let (status, body) = get_json(&format!("{app}/health")).await;
        assert_eq!(status, 200);
        assert_eq!(body["status"], "ok");
        assert_eq!(body["waiting"], 0);
    }

    #[tokio::test]
    async fn rejects_bad_index_and_missing_hash() {
        let app = spawn_app("http://127.0.0.1:9".into(), temp_static_dir()).await;

        let (status, body) = get_json(&format!("{app}/api/ffprobe?hash={HASH}&index=-1")).await;
        assert_eq!(status, 400);
        assert_eq!(body["error"], "Invalid index: must be a non-negative integer");

        let (status, body) = get_json(&format!("{app}/api/ffprobe-auto?index=2")).await;
        assert_eq!(status, 400);
        assert_eq!(body["error"], "Hash is required or invalid magnet link");
    }

    #[tokio::test]
    async fn direct_probe_defaults_to_index_one() {
        let server = MockServer::start_async().await;
        let probe = server
            .mock_async(|when, then| {
                when.method(GET).path(format!("/ffp/{HASH}/1"));
                then.status(200).body(r#"{"streams":[{"codec_type":"audio"}]}"#);
            })
            .await;

        let app = spawn_app(server.base_url(), temp_static_dir()).await;
        let (status, body) =
            get_json(&format!("{app}/api/ffprobe?hash={}", HASH.to_uppercase())).await;

        probe.assert_async().await;
        assert_eq!(status, 200);
        assert_eq!(body["streams"][0]["codec_type"], "audio");
    }

    #[tokio::test]
    async fn auth_failure_is_reworded() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(GET).path(format!("/ffp/{HASH}/0"));
                then.status(401).body("Unauthorized");
            })
            .await;

        let app = spawn_app(server.base_url(), temp_static_dir()).await;
        let (status, body) = get_json(&format!("{app}/api/ffprobe?hash={HASH}&index=0")).await;
        assert_eq!(status, 401);
        assert_eq!(body["error"], "Authentication failed. Check server credentials.");
    }

    #[tokio::test]
    async fn non_json_probe_becomes_500() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(GET).path(format!("/ffp/{HASH}/1"));
                then.status(200).body("<html>");
            })
            .await;

        let app = spawn_app(server.base_url(), temp_static_dir()).await;
        let (status, body) = get_json(&format!("{app}/api/ffprobe?hash={HASH}")).await;
        assert_eq!(status, 500);
        assert_eq!(body["error"], "Failed to parse response");
    }

    #[tokio::test]
    async fn auto_probes_known_torrent_directly() {
        let server = MockServer::start_async().await;
        let get = server
            .mock_async(|when, then| {
                when.method(POST)
                    .path("/torrents")
                    .json_body(json!({ "action": "get", "hash": HASH }));
                then.status(200).body(r#"{"file_stats":[{"id":1}]}"#);
            })
            .await;
        let probe = server
            .mock_async(|when, then| {
                when.method(GET).path(format!("/ffp/{HASH}/3"));
                then.status(200).body(r#"{"streams":[]}"#);
            })
            .await;

        let app = spawn_app(server.base_url(), temp_static_dir()).await;
        let magnet = format!("magnet:?xt=urn:btih:{HASH}%26dn=x");
        let (status, _) = get_json(&format!("{app}/api/ffprobe-auto?hash={magnet}&index=3")).await;

        assert_eq!(status, 200);
        get.assert_async().await;
        probe.assert_async().await;
    }

    #[tokio::test]
    async fn auto_reports_failed_add() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(POST).path("/torrents");
                then.status(500).body("down");
            })
            .await;

        let app = spawn_app(server.base_url(), temp_static_dir()).await;
        let (status, body) = get_json(&format!("{app}/api/ffprobe-auto?hash={HASH}")).await;
        assert_eq!(status, 400);
        assert_eq!(body["error"], "Failed to add torrent to TorrServer");
        assert_eq!(body["hash"], HASH);
    }

    #[tokio::test]
    async fn auto_waits_for_metadata_then_gives_up() {
        let server = MockServer::start_async().await;
        let get = server
            .mock_async(|when, then| {
                when.method(POST)
                    .path("/torrents")
                    .json_body(json!({ "action": "get", "hash": HASH }));
                then.status(404).body("not found");
            })
            .await;
        let add = server
            .mock_async(|when, then| {
                when.method(POST).path("/torrents").json_body(json!({
                    "action": "add",
                    "link": HASH,
                    "title": "Film",
                    "save_to_db": false,
                }));
                then.status(200).body(r#"{"hash":"x"}"#);
            })
            .await;

        let app = spawn_app(server.base_url(), temp_static_dir()).await;
        let (status, body) =
            get_json(&format!("{app}/api/ffprobe-auto?hash={HASH}&title=Film")).await;

        assert_eq!(status, 404);
        assert_eq!(body["error"], "Torrent not available");
        add.assert_async().await;
        // One existence query plus two readiness checks.
        assert_eq!(get.calls_async().await, 3);
    }

    #[tokio::test]
    async fn serves_static_files_with_cors() {
        let dir = temp_static_dir();
        std::fs::write(dir.join("index.html"), "<h1>tracks</h1>").unwrap();
        let app = spawn_app("http://127.0.0.1:9".into(), dir).await;

        let client = reqwest::Client::new();
        let resp = client
            .get(format!("{app}/"))
            .header("Origin", "http://example.com")
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status().as_u16(), 200);
        assert_eq!(
            resp.headers()
                .get("access-control-allow-origin")
                .and_then(|v| v.to_str().ok()),
            Some("*")
        );
        assert_eq!(resp.text().await.unwrap(), "<h1>tracks</h1>");

        let missing = reqwest::get(format!("{app}/nope.js")).await.unwrap();
        assert_eq!(missing.status().as_u16(), 404);
        assert_eq!(missing.text().await.unwrap(), "<h1>404 - File Not Found</h1>");
    }

    #[test]
    fn detects_parent_segments() {
        assert!(escapes_root("/../etc/passwd"));
        assert!(escapes_root("/assets/%2E%2E/secret"));
        assert!(escapes_root("/a/..%5csecret"));
        assert!(escapes_root("/.."));
        assert!(!escapes_root("/"));
        assert!(!escapes_root("/app.js"));
        assert!(!escapes_root("/notes..txt"));
        assert!(!escapes_root("/.well-known/x"));
    }

    #[tokio::test]
    async fn traversal_is_forbidden() {
        let dir = temp_static_dir();
        let app = spawn_app("http://127.0.0.1:9".into(), dir).await;

        // reqwest normalizes dot segments, so speak HTTP directly.
        let mut socket = tokio::net::TcpStream::connect(app.trim_start_matches("http://"))
            .await
            .unwrap();
        socket
            .write_all(b"GET /../Cargo.toml HTTP/1.1\r\nhost: localhost\r\nconnection: close\r\n\r\n")
            .await
            .unwrap();
        let mut raw = String::new();
        socket.read_to_string(&mut raw).await.unwrap();

        assert!(raw.starts_with("HTTP/1.1 403"), "{raw}");
        assert!(raw.ends_with(r#"{"error":"Forbidden"}"#), "{raw}");
    }
}
