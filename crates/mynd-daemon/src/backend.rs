//! Playback backend adapter.
//!
//! Commands go to moOde's HTTP command API (`GET <base>/command/?cmd=...`);
//! playback state is read from MPD's status socket (see `mpd`).

use crate::mpd::MpdStatusClient;
use async_trait::async_trait;
use mynd_proto::config::MoodeConfig;
use reqwest::header::LOCATION;
use reqwest::{Client, Response, StatusCode};
use std::future::Future;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Fixed delay between attempts of one call.
pub const RETRY_DELAY: Duration = Duration::from_millis(500);

pub const CMD_VOLUME_UP: &str = "set_volume -up 5";
pub const CMD_VOLUME_DOWN: &str = "set_volume -dn 5";
pub const CMD_TOGGLE_PLAY_PAUSE: &str = "toggle_play_pause";
pub const CMD_PAUSE: &str = "pause";
pub const CMD_NEXT: &str = "next";
pub const CMD_PREVIOUS: &str = "previous";
const CMD_GET_VOLUME: &str = "get_volume";

pub fn set_volume_command(volume: i64) -> String {
    format!("set_volume {volume}")
}

#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    #[error("request timed out")]
    Timeout,
    #[error("connection failed: {0}")]
    Connect(String),
    #[error("HTTP {0}")]
    Status(u16),
    #[error("command error in response: {0}")]
    Rejected(String),
    #[error("redirect without a usable location")]
    BadRedirect,
    #[error("request failed: {0}")]
    Request(String),
}

impl BackendError {
    fn from_reqwest(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            BackendError::Timeout
        } else if e.is_connect() {
            BackendError::Connect(e.to_string())
        } else {
            BackendError::Request(e.to_string())
        }
    }

    /// Transport trouble is worth another attempt; a command the backend
    /// answered with an error is not.
    pub fn is_transient(&self) -> bool {
        !matches!(self, BackendError::Rejected(_))
    }

    fn kind(&self) -> &'static str {
        match self {
            BackendError::Timeout => "Timeout",
            BackendError::Connect(_) => "Connection",
            BackendError::Status(_) => "HTTP",
            BackendError::Rejected(_) => "Command",
            BackendError::BadRedirect => "Redirect",
            BackendError::Request(_) => "Request",
        }
    }
}

/// Everything the daemon needs from the playback side.
#[async_trait]
pub trait Playback: Send + Sync {
    /// Run one backend command.
    async fn command(&self, command: &str) -> Result<(), BackendError>;

    /// Current volume, or `None` when it cannot be determined.
    async fn volume(&self) -> Option<i64>;

    /// Lowercased MPD `state:` value, or `None` when unavailable.
    async fn playback_state(&self) -> Option<String>;
}

/// Map an MPD state literal onto "is audio streaming".
pub fn streaming_active(state: Option<&str>) -> Option<bool> {
    match state? {
        "play" => Some(true),
        "pause" | "stop" => Some(false),
        "" => None,
        other => {
            warn!("Unknown MPD state value: {}", other);
            None
        }
    }
}

fn body_signals_error(body: &str) -> bool {
    let text = body.trim().to_lowercase();
    !text.is_empty() && (text.contains("error") || text.contains("ack"))
}

fn excerpt(body: &str) -> String {
    body.trim().chars().take(200).collect()
}

// ── HTTP command API ──────────────────────────────────────────────────────────

pub struct MoodeClient {
    client: Client,
    base_url: String,
    retry_count: u32,
    retry_delay: Duration,
}

impl MoodeClient {
    pub fn new(config: &MoodeConfig) -> Result<Self, BackendError> {
        let client = Client::builder()
            .timeout(config.api_timeout())
            // 301/302 are followed by hand, exactly once
            .redirect(reqwest::redirect::Policy::none())
            // localhost, self-signed at best
            .danger_accept_invalid_certs(true)
            .build()
            .map_err(BackendError::from_reqwest)?;

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            retry_count: config.retry_count,
            retry_delay: RETRY_DELAY,
        })
    }

    fn command_url(&self) -> String {
        format!("{}/command/", self.base_url)
    }

    /// One GET, following a single 301/302 hop with the same method.
    async fn get(&self, command: &str) -> Result<Response, BackendError> {
        let response = self
            .client
            .get(self.command_url())
            .query(&[("cmd", command)])
            .send()
            .await
            .map_err(BackendError::from_reqwest)?;

        let status = response.status();
        if status != StatusCode::MOVED_PERMANENTLY && status != StatusCode::FOUND {
            return Ok(response);
        }

        let target = response
            .headers()
            .get(LOCATION)
            .and_then(|v| v.to_str().ok())
            .and_then(|location| response.url().join(location).ok())
            .ok_or(BackendError::BadRedirect)?;
        warn!(
            "Moode API GET {}: redirected to {}, status {}",
            command,
            target,
            status.as_u16()
        );
        self.client
            .get(target)
            .send()
            .await
            .map_err(BackendError::from_reqwest)
    }

    /// GET and return the body of a 200 response.
    async fn fetch_body(&self, command: &str) -> Result<String, BackendError> {
        let response = self.get(command).await?;
        if response.status() != StatusCode::OK {
            return Err(BackendError::Status(response.status().as_u16()));
        }
        response.text().await.map_err(BackendError::from_reqwest)
    }

    /// Run `attempt` up to `retry_count` times.  Only the final failure is
    /// logged; terminal errors end the loop at once.
    async fn with_retries<T, F, Fut>(&self, command: &str, mut attempt: F) -> Result<T, BackendError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, BackendError>>,
    {
        let attempts = self.retry_count.max(1);
        let mut n = 1;
        loop {
            match attempt().await {
                Ok(value) => return Ok(value),
                Err(e) if !e.is_transient() => return Err(e),
                Err(e) if n >= attempts => {
                    error!(
                        "Moode API {} failed after {} attempts: {}",
                        e.kind(),
                        attempts,
                        e
                    );
                    error!("  URL: {}?cmd={}", self.command_url(), command);
                    if matches!(e, BackendError::Connect(_)) {
                        error!("  Check if Moode is running and accessible at {}", self.base_url);
                    }
                    return Err(e);
                }
                Err(e) => {
                    debug!(
                        "Moode API request failed (attempt {}/{}): {}",
                        n, attempts, e
                    );
                    tokio::time::sleep(self.retry_delay).await;
                    n += 1;
                }
            }
        }
    }

    pub async fn command(&self, command: &str) -> Result<(), BackendError> {
        self.with_retries(command, move || async move {
            let body = self.fetch_body(command).await?;
            if body_signals_error(&body) {
                warn!(
                    "Moode API GET {}: command error in response: {}",
                    command,
                    excerpt(&body)
                );
                return Err(BackendError::Rejected(excerpt(&body)));
            }
            Ok(())
        })
        .await?;
        info!("Moode API GET {}: OK", command);
        Ok(())
    }

    pub async fn get_volume(&self) -> Option<i64> {
        let body = self
            .with_retries(CMD_GET_VOLUME, move || self.fetch_body(CMD_GET_VOLUME))
            .await
            .ok()?;

        let volume = parse_volume(&body);
        if volume.is_none() {
            warn!("Failed to parse volume response: {}", excerpt(&body));
        }
        volume
    }
}

/// moOde reports volume as a number or a numeric string.  A reply without
/// the field reads as 0 and fractional numbers are truncated.
fn parse_volume(body: &str) -> Option<i64> {
    let json: serde_json::Value = serde_json::from_str(body).ok()?;
    match json.as_object()?.get("volume") {
        None => Some(0),
        Some(serde_json::Value::Number(n)) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)),
        Some(serde_json::Value::String(s)) => s.trim().parse().ok(),
        Some(_) => None,
    }
}

// ── composite backend ─────────────────────────────────────────────────────────

pub struct Moode {
    api: MoodeClient,
    status: MpdStatusClient,
}

impl Moode {
    pub fn new(config: &MoodeConfig) -> Result<Self, BackendError> {
        Ok(Self {
            api: MoodeClient::new(config)?,
            status: MpdStatusClient::new(config),
        })
    }
}

#[async_trait]
impl Playback for Moode {
    async fn command(&self, command: &str) -> Result<(), BackendError> {
        self.api.command(command).await
    }

    async fn volume(&self) -> Option<i64> {
        self.api.get_volume().await
    }

    async fn playback_state(&self) -> Option<String> {
        self.status.playback_state().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::spawn_http;
    use axum::extract::{Query, State};
    use axum::http::{header, StatusCode as AxumStatus};
    use axum::response::IntoResponse;
    use axum::routing::get;
    use axum::Router;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    #[derive(Clone, Default)]
    struct Hits {
        count: Arc<AtomicUsize>,
        cmds: Arc<Mutex<Vec<String>>>,
    }

    impl Hits {
        fn record(&self, params: &HashMap<String, String>) -> usize {
            if let Some(cmd) = params.get("cmd") {
                self.cmds.lock().unwrap().push(cmd.clone());
            }
            self.count.fetch_add(1, Ordering::SeqCst) + 1
        }

        fn count(&self) -> usize {
            self.count.load(Ordering::SeqCst)
        }
    }

    fn client_for(addr: std::net::SocketAddr, api_timeout: f64) -> MoodeClient {
        let config = MoodeConfig {
            base_url: format!("http://{addr}"),
            api_timeout,
            retry_count: 3,
            ..MoodeConfig::default()
        };
        MoodeClient::new(&config).unwrap()
    }

    #[test]
    fn streaming_state_mapping() {
        assert_eq!(streaming_active(Some("play")), Some(true));
        assert_eq!(streaming_active(Some("pause")), Some(false));
        assert_eq!(streaming_active(Some("stop")), Some(false));
        assert_eq!(streaming_active(Some("buffering")), None);
        assert_eq!(streaming_active(Some("")), None);
        assert_eq!(streaming_active(None), None);
    }

    #[test]
    fn error_and_ack_bodies() {
        assert!(body_signals_error("ACK [50@0] {play} No such song"));
        assert!(body_signals_error("{\"error\":\"bad\"}"));
        assert!(!body_signals_error("OK"));
        assert!(!body_signals_error("   "));
    }

    #[tokio::test]
    async fn command_is_sent_escaped() {
        let hits = Hits::default();
        let app = Router::new()
            .route(
                "/command/",
                get(|State(hits): State<Hits>, Query(q): Query<HashMap<String, String>>| async move {
                    hits.record(&q);
                    "OK"
                }),
            )
            .with_state(hits.clone());
        let client = client_for(spawn_http(app).await, 2.0);

        client.command(CMD_VOLUME_UP).await.unwrap();
        assert_eq!(hits.cmds.lock().unwrap().as_slice(), ["set_volume -up 5"]);
    }

    #[tokio::test]
    async fn error_body_fails_without_retry() {
        let hits = Hits::default();
        let app = Router::new()
            .route(
                "/command/",
                get(|State(hits): State<Hits>, Query(q): Query<HashMap<String, String>>| async move {
                    hits.record(&q);
                    "ACK [2@0] {} error"
                }),
            )
            .with_state(hits.clone());
        let client = client_for(spawn_http(app).await, 2.0);

        let err = client.command(CMD_NEXT).await.unwrap_err();
        assert!(matches!(err, BackendError::Rejected(_)));
        assert_eq!(hits.count(), 1);
    }

    #[tokio::test]
    async fn three_timeouts_exhaust_the_retries() {
        let hits = Hits::default();
        let app = Router::new()
            .route(
                "/command/",
                get(|State(hits): State<Hits>, Query(q): Query<HashMap<String, String>>| async move {
                    hits.record(&q);
                    tokio::time::sleep(Duration::from_secs(2)).await;
                    "OK"
                }),
            )
            .with_state(hits.clone());
        let client = client_for(spawn_http(app).await, 0.1);

        let err = client.command(CMD_PAUSE).await.unwrap_err();
        assert!(matches!(err, BackendError::Timeout), "got {err:?}");
        assert_eq!(hits.count(), 3);

        // nothing else arrives for this invocation
        tokio::time::sleep(Duration::from_millis(700)).await;
        assert_eq!(hits.count(), 3);
    }

    #[tokio::test]
    async fn server_errors_are_retried_until_success() {
        let hits = Hits::default();
        let app = Router::new()
            .route(
                "/command/",
                get(|State(hits): State<Hits>, Query(q): Query<HashMap<String, String>>| async move {
                    if hits.record(&q) == 1 {
                        (AxumStatus::SERVICE_UNAVAILABLE, "busy").into_response()
                    } else {
                        "OK".into_response()
                    }
                }),
            )
            .with_state(hits.clone());
        let client = client_for(spawn_http(app).await, 2.0);

        client.command(CMD_TOGGLE_PLAY_PAUSE).await.unwrap();
        assert_eq!(hits.count(), 2);
    }

    #[tokio::test]
    async fn redirect_is_followed_once() {
        let hits = Hits::default();
        let app = Router::new()
            .route(
                "/command/",
                get(|| async { (AxumStatus::FOUND, [(header::LOCATION, "/moved/?cmd=next")]) }),
            )
            .route(
                "/moved/",
                get(|State(hits): State<Hits>, Query(q): Query<HashMap<String, String>>| async move {
                    hits.record(&q);
                    "OK"
                }),
            )
            .with_state(hits.clone());
        let client = client_for(spawn_http(app).await, 2.0);

        client.command(CMD_NEXT).await.unwrap();
        assert_eq!(hits.cmds.lock().unwrap().as_slice(), ["next"]);
    }

    #[tokio::test]
    async fn redirect_loops_are_not_chased() {
        let hits = Hits::default();
        let app = Router::new()
            .route(
                "/command/",
                get(|State(hits): State<Hits>, Query(q): Query<HashMap<String, String>>| async move {
                    hits.record(&q);
                    (AxumStatus::FOUND, [(header::LOCATION, "/command/?cmd=next")])
                }),
            )
            .with_state(hits.clone());
        let client = client_for(spawn_http(app).await, 2.0);

        let err = client.command(CMD_NEXT).await.unwrap_err();
        assert!(matches!(err, BackendError::Status(302)));
        // two requests (first GET + one hop) per attempt
        assert_eq!(hits.count(), 6);
    }

    #[tokio::test]
    async fn volume_parsing() {
        let app = Router::new().route(
            "/command/",
            get(|| async { r#"{"volume":"0"}"# }),
        );
        let client = client_for(spawn_http(app).await, 2.0);
        assert_eq!(client.get_volume().await, Some(0));

        let app = Router::new().route("/command/", get(|| async { r#"{"volume": 42}"# }));
        let client = client_for(spawn_http(app).await, 2.0);
        assert_eq!(client.get_volume().await, Some(42));

        let app = Router::new().route("/command/", get(|| async { "not json" }));
        let client = client_for(spawn_http(app).await, 2.0);
        assert_eq!(client.get_volume().await, None);
    }

    #[test]
    fn volume_field_shapes() {
        assert_eq!(parse_volume(r#"{"volume": " 17 "}"#), Some(17));
        assert_eq!(parse_volume(r#"{"volume": 5.0}"#), Some(5));
        assert_eq!(parse_volume(r#"{"volume": 33.9}"#), Some(33));
        assert_eq!(parse_volume(r#"{"muted": "0"}"#), Some(0));
        assert_eq!(parse_volume("{}"), Some(0));
        assert_eq!(parse_volume(r#"{"volume": "loud"}"#), None);
        assert_eq!(parse_volume(r#"{"volume": null}"#), None);
        assert_eq!(parse_volume("[1, 2]"), None);
    }

    #[tokio::test]
    async fn unreachable_backend_reports_connection_failure() {
        // bind then drop to get a port nobody listens on
        let addr = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap()
        };
        let client = client_for(addr, 1.0);
        let err = client.command(CMD_NEXT).await.unwrap_err();
        assert!(err.is_transient());
        assert_eq!(client.get_volume().await, None);
    }
}
