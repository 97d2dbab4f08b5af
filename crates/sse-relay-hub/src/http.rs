use axum::{
    body::Body,
    extract::{Path, State},
    http::{header, HeaderMap, HeaderName, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;
use serde::Serialize;
use sse_relay_core::{
    LocalMultiplexer, MultiplexerStats, Relay, RelayConfig, RelayError, RelayResult,
    StreamRequest, STREAM_HEADERS,
};
use std::{convert::Infallible, sync::Arc};
use tracing::{info, warn};

#[derive(Clone)]
pub struct AppState {
    relay: Arc<Relay>,
    bus: Arc<LocalMultiplexer>,
}

impl AppState {
    pub fn new(config: RelayConfig, bus: Arc<LocalMultiplexer>) -> RelayResult<Self> {
        let relay = Relay::builder()
            .config(config)
            .multiplexer(bus.clone())
            .build()?;
        Ok(Self {
            relay: Arc::new(relay),
            bus,
        })
    }
}

#[derive(Debug, Serialize)]
struct PublishReceipt {
    channel: String,
    delivered: usize,
    published_at: String,
}

#[derive(Debug, Serialize)]
struct StatsView {
    open_sessions: usize,
    #[serde(flatten)]
    multiplexer: MultiplexerStats,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/subscribe/:channel", get(subscribe_handler))
        .route("/publish/:channel", post(publish_handler))
        .route("/stats", get(stats_handler))
        .route("/health", get(|| async { "ok" }))
        .with_state(state)
}

async fn subscribe_handler(
    Path(channel): Path<String>,
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Response {
    let accept = headers
        .get(header::ACCEPT)
        .and_then(|value| value.to_str().ok());
    let requested_with = headers
        .get("x-requested-with")
        .and_then(|value| value.to_str().ok());
    let request = StreamRequest::new(accept).requested_with(requested_with);

    let (session, frames) = match state.relay.open(&channel, request) {
        Ok(opened) => opened,
        Err(err) => return rejection(&err),
    };
    tokio::spawn(session.run());

    let body = futures_util::stream::unfold(frames, |mut frames| async move {
        frames
            .next_frame()
            .await
            .map(|frame| (Ok::<_, Infallible>(frame), frames))
    });
    let mut response = Response::new(Body::from_stream(body));
    for (name, value) in STREAM_HEADERS {
        response.headers_mut().insert(
            HeaderName::from_static(name),
            HeaderValue::from_static(value),
        );
    }
    response
}

fn rejection(err: &RelayError) -> Response {
    let status =
        StatusCode::from_u16(err.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    if status.is_server_error() {
        warn!(event = "subscribe_error", error = %err);
    }
    status.into_response()
}

async fn publish_handler(
    Path(channel): Path<String>,
    State(state): State<AppState>,
    body: String,
) -> Response {
    let payload = (!body.is_empty()).then_some(body.as_str());
    let delivered = state.bus.publish(&channel, payload);
    info!(
        event = "publish",
        channel = %channel,
        delivered = delivered,
        bytes = body.len()
    );
    Json(PublishReceipt {
        channel,
        delivered,
        published_at: Utc::now().to_rfc3339(),
    })
    .into_response()
}

async fn stats_handler(State(state): State<AppState>) -> Json<StatsView> {
    Json(StatsView {
        open_sessions: state.relay.open_sessions(),
        multiplexer: state.bus.stats(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Value;
    use std::net::SocketAddr;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream};

    async fn launch_relay() -> (SocketAddr, AppState) {
        let bus = Arc::new(LocalMultiplexer::new());
        let state = AppState::new(RelayConfig::default(), bus).expect("app state");
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("local addr");
        let app = router(state.clone());
        tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });
        (addr, state)
    }

    async fn send_request(addr: SocketAddr, request: String) -> TcpStream {
        let mut stream = TcpStream::connect(addr)
            .await
            .unwrap_or_else(|err| panic!("connect failed: {err}"));
        stream
            .write_all(request.as_bytes())
            .await
            .expect("request write");
        stream
    }

    fn subscribe_request(channel: &str, accept: Option<&str>) -> String {
        let accept = accept
            .map(|value| format!("Accept: {value}\r\n"))
            .unwrap_or_default();
        format!("GET /subscribe/{channel} HTTP/1.1\r\nHost: localhost\r\n{accept}\r\n")
    }

    async fn read_until(stream: &mut TcpStream, needle: &str) -> String {
        let mut received = Vec::new();
        let mut chunk = [0u8; 1024];
        loop {
            let read = tokio::time::timeout(Duration::from_secs(3), stream.read(&mut chunk))
                .await
                .expect("read timeout")
                .expect("read error");
            assert!(read > 0, "unexpected EOF");
            received.extend_from_slice(&chunk[..read]);
            let text = String::from_utf8_lossy(&received);
            if text.contains(needle) {
                return text.into_owned();
            }
        }
    }

    async fn read_to_end(stream: &mut TcpStream) -> String {
        let mut received = Vec::new();
        tokio::time::timeout(Duration::from_secs(3), stream.read_to_end(&mut received))
            .await
            .expect("read timeout")
            .expect("read error");
        String::from_utf8_lossy(&received).into_owned()
    }

    fn response_body(raw: &str) -> &str {
        raw.split_once("\r\n\r\n").map(|(_, body)| body).unwrap_or_default()
    }

    async fn publish_over_http(addr: SocketAddr, channel: &str, body: &str) -> Value {
        let request = format!(
            "POST /publish/{channel} HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\nContent-Length: {}\r\n\r\n{body}",
            body.len()
        );
        let mut stream = send_request(addr, request).await;
        let raw = read_to_end(&mut stream).await;
        serde_json::from_str(response_body(&raw)).expect("publish receipt")
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn subscribe_streams_published_messages() {
        let (addr, state) = launch_relay().await;
        let mut client = send_request(addr, subscribe_request("news", Some("text/event-stream"))).await;

        let head = read_until(&mut client, "\r\n\r\n").await.to_lowercase();
        assert!(head.starts_with("http/1.1 200"), "unexpected head: {head}");
        assert!(head.contains("content-type: text/event-stream"));
        assert!(head.contains("cache-control: no-cache"));
        assert!(head.contains("connection: keep-alive"));
        assert_eq!(state.relay.open_sessions(), 1);

        let receipt = publish_over_http(addr, "news", "hello\nworld").await;
        assert_eq!(receipt["channel"], "news");
        assert_eq!(receipt["delivered"], 1);
        assert!(receipt["published_at"].is_string());

        let streamed = read_until(&mut client, "data:world\n\n").await;
        assert!(streamed.contains("data:hello\ndata:world\n\n"));

        let other = publish_over_http(addr, "sports", "goal").await;
        assert_eq!(other["delivered"], 0);

        drop(client);
        for _ in 0..100 {
            if state.bus.listener_count() == 0 {
                break;
            }
            state.bus.publish("news", Some("ping"));
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(state.bus.listener_count(), 0);
        assert_eq!(state.bus.subscription_count("news"), 0);
        assert_eq!(state.relay.open_sessions(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn burst_reaches_client_without_disconnect() {
        let (addr, state) = launch_relay().await;
        let mut client = send_request(addr, subscribe_request("news", Some("text/event-stream"))).await;
        read_until(&mut client, "\r\n\r\n").await;

        for i in 0..100 {
            assert_eq!(state.bus.publish("news", Some(format!("msg-{i}").as_str())), 1);
        }
        let streamed = read_until(&mut client, "data:msg-99\n\n").await;
        let mut last = 0;
        for i in 0..100 {
            let frame = format!("data:msg-{i}\n\n");
            let at = streamed.find(&frame).unwrap_or_else(|| panic!("missing {frame:?}"));
            assert!(at >= last, "{frame:?} out of order");
            last = at;
        }
        assert_eq!(state.relay.open_sessions(), 1);
        assert_eq!(state.bus.listener_count(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn subscribe_without_event_stream_accept_is_rejected() {
        let (addr, state) = launch_relay().await;

        for accept in [None, Some("text/html"), Some("*/*")] {
            let mut request = subscribe_request("news", accept);
            request.insert_str(request.len() - 2, "Connection: close\r\n");
            let mut client = send_request(addr, request).await;
            let raw = read_to_end(&mut client).await.to_lowercase();
            assert!(raw.starts_with("http/1.1 404"), "unexpected response: {raw}");
            assert!(!raw.contains("text/event-stream"));
        }

        assert_eq!(state.bus.stats(), MultiplexerStats::default());
        assert_eq!(state.relay.open_sessions(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn stats_report_open_sessions() {
        let (addr, _state) = launch_relay().await;
        let mut first = send_request(addr, subscribe_request("alpha", Some("text/event-stream"))).await;
        let mut second = send_request(addr, subscribe_request("beta", Some("text/event-stream"))).await;
        read_until(&mut first, "\r\n\r\n").await;
        read_until(&mut second, "\r\n\r\n").await;

        let request =
            "GET /stats HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n".to_string();
        let mut client = send_request(addr, request).await;
        let raw = read_to_end(&mut client).await;
        let stats: Value = serde_json::from_str(response_body(&raw)).expect("stats json");

        assert_eq!(stats["open_sessions"], 2);
        assert_eq!(stats["listeners"], 2);
        assert_eq!(stats["subscriptions"]["alpha"], 1);
        assert_eq!(stats["subscriptions"]["beta"], 1);
        assert_eq!(stats["subscribe_calls"], 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn health_answers_ok() {
        let (addr, _state) = launch_relay().await;
        let request =
            "GET /health HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n".to_string();
        let mut client = send_request(addr, request).await;
        let raw = read_to_end(&mut client).await;
        assert_eq!(response_body(&raw), "ok");
    }
}
