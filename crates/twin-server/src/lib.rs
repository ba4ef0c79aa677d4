//! Digital Twin Server
//!
//! Accepts dashboard connections, upgrades them to WebSocket sessions fed
//! by the 100 Hz tick driver, and answers every other HTTP request with
//! the health probe.

pub mod broadcast;
pub mod session;
pub mod tick;

mod error;

use std::sync::Arc;

use axum::extract::{FromRequestParts, Request, State, WebSocketUpgrade};
use axum::http::header;
use axum::response::{IntoResponse, Response};
use axum::Router;
use tokio::net::TcpListener;

use twin_physics::EngineControls;

use crate::broadcast::SessionSet;

pub use error::ServerError;

/// Identification header on plain HTTP responses.
const SERVER_NAME: &str = "DigitalTwin/1.0";

/// State shared with the request handlers.
pub struct AppState {
    /// Engine control surface handed to each new session
    pub controls: Arc<EngineControls>,
    /// Live session registry shared with the tick driver
    pub sessions: Arc<SessionSet>,
}

/// Build the application router.
///
/// Every request lands on the fallback: WebSocket upgrades become
/// sessions, anything else is answered with the health response.
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new().fallback(root_handler).with_state(state)
}

async fn root_handler(State(state): State<Arc<AppState>>, request: Request) -> Response {
    // Upgrade detection needs only the request head; the body is
    // irrelevant to both outcomes.
    let (mut parts, _) = request.into_parts();
    if let Ok(upgrade) = WebSocketUpgrade::from_request_parts(&mut parts, &()).await {
        let controls = Arc::clone(&state.controls);
        let sessions = Arc::clone(&state.sessions);
        return upgrade
            .on_upgrade(move |socket| session::run_session(socket, controls, sessions))
            .into_response();
    }
    health_response()
}

/// Health probe: `200 OK`, plain-text `ok`, permissive CORS.
fn health_response() -> Response {
    (
        [
            (header::SERVER, SERVER_NAME),
            (header::CONTENT_TYPE, "text/plain"),
            (header::ACCESS_CONTROL_ALLOW_ORIGIN, "*"),
        ],
        "ok",
    )
        .into_response()
}

/// Bind the TCP listener. Failure here is fatal at startup.
pub async fn bind_listener(addr: &str) -> Result<TcpListener, ServerError> {
    TcpListener::bind(addr)
        .await
        .map_err(|source| ServerError::Bind {
            addr: addr.to_string(),
            source,
        })
}

/// Serve the router on the bound listener until the runtime shuts down.
pub async fn serve(listener: TcpListener, router: Router) -> Result<(), ServerError> {
    axum::serve(listener, router).await?;
    Ok(())
}

/// Initialize logging.
pub fn init_logging() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "twin_server=info,twin_physics=info".into()),
        )
        .init();
}

#[cfg(test)]
mod tests {
    use std::net::SocketAddr;
    use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
    use std::time::Duration;

    use futures_util::{SinkExt, StreamExt};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpStream;
    use tokio_tungstenite::tungstenite::Message as WsMessage;

    use twin_physics::{EngineConfig, PhysicsEngine};

    use super::*;
    use crate::broadcast::BroadcastPool;
    use crate::tick::run_tick_loop;

    /// Full stack on an ephemeral port: axum on the test runtime, the tick
    /// driver on its own thread, stopped when the fixture drops.
    struct TestServer {
        addr: SocketAddr,
        controls: Arc<EngineControls>,
        sessions: Arc<SessionSet>,
        stop: Arc<AtomicBool>,
        driver: Option<std::thread::JoinHandle<()>>,
    }

    impl TestServer {
        async fn start() -> Self {
            let engine = PhysicsEngine::new(EngineConfig::default());
            let controls = engine.controls();
            let sessions = Arc::new(SessionSet::new());
            let stop = Arc::new(AtomicBool::new(false));

            let state = Arc::new(AppState {
                controls: Arc::clone(&controls),
                sessions: Arc::clone(&sessions),
            });

            let listener = bind_listener("127.0.0.1:0").await.unwrap();
            let addr = listener.local_addr().unwrap();
            tokio::spawn(serve(listener, create_router(state)));

            let driver = {
                let sessions = Arc::clone(&sessions);
                let stop = Arc::clone(&stop);
                std::thread::spawn(move || {
                    run_tick_loop(
                        engine,
                        BroadcastPool::with_defaults(),
                        sessions,
                        stop,
                        Duration::from_millis(10),
                    );
                })
            };

            Self {
                addr,
                controls,
                sessions,
                stop,
                driver: Some(driver),
            }
        }

        async fn connect_ws(&self) -> tokio_tungstenite::WebSocketStream<
            tokio_tungstenite::MaybeTlsStream<TcpStream>,
        > {
            let url = format!("ws://{}/ws", self.addr);
            let (ws, _) = tokio_tungstenite::connect_async(url).await.unwrap();
            ws
        }
    }

    impl Drop for TestServer {
        fn drop(&mut self) {
            self.stop.store(true, Ordering::Relaxed);
            if let Some(driver) = self.driver.take() {
                let _ = driver.join();
            }
        }
    }

    #[tokio::test]
    async fn test_health_endpoint_answers_ok() {
        let server = TestServer::start().await;

        let mut stream = TcpStream::connect(server.addr).await.unwrap();
        stream
            .write_all(b"GET /health HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n")
            .await
            .unwrap();

        let mut response = Vec::new();
        stream.read_to_end(&mut response).await.unwrap();
        let response = String::from_utf8(response).unwrap();

        assert!(response.starts_with("HTTP/1.1 200 OK"), "{response}");
        assert!(response.to_ascii_lowercase().contains("access-control-allow-origin: *"));
        assert!(response.to_ascii_lowercase().contains("content-type: text/plain"));
        assert!(response.contains("DigitalTwin/1.0"));
        assert!(response.ends_with("ok"));
    }

    #[tokio::test]
    async fn test_websocket_streams_state_frames() {
        let server = TestServer::start().await;
        let mut ws = server.connect_ws().await;

        let mut received = 0;
        while received < 5 {
            match ws.next().await.unwrap().unwrap() {
                WsMessage::Text(text) => {
                    let value: serde_json::Value = serde_json::from_str(text.as_str()).unwrap();
                    assert_eq!(value["type"], "state");

                    let payload = &value["payload"];
                    let angle = payload["angle_rad"].as_f64().unwrap();
                    assert!((0.0..std::f64::consts::TAU).contains(&angle));
                    assert!(payload["timestamp_ms"].as_u64().is_some());
                    received += 1;
                }
                _ => {}
            }
        }
    }

    #[tokio::test]
    async fn test_set_rpm_command_reaches_engine() {
        let server = TestServer::start().await;
        let mut ws = server.connect_ws().await;

        ws.send(WsMessage::Text(
            r#"{"type":"set_rpm","payload":{"rpm_target":3000}}"#.into(),
        ))
        .await
        .unwrap();

        let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
        while server.controls.rpm_target() != 3000.0 {
            assert!(
                tokio::time::Instant::now() < deadline,
                "set_rpm was not applied"
            );
            // Keep draining so the session never hits its queue bound.
            let _ = tokio::time::timeout(Duration::from_millis(20), ws.next()).await;
        }
    }

    #[tokio::test]
    async fn test_malformed_frames_leave_connection_open() {
        let server = TestServer::start().await;
        let mut ws = server.connect_ws().await;

        ws.send(WsMessage::Text(r#"{"type":"bogus"}"#.into()))
            .await
            .unwrap();
        ws.send(WsMessage::Text("not json".into())).await.unwrap();

        // Broadcast continues uninterrupted on the same connection.
        let mut received = 0;
        while received < 3 {
            if let WsMessage::Text(_) = ws.next().await.unwrap().unwrap() {
                received += 1;
            }
        }
    }

    #[tokio::test]
    async fn test_replay_command_is_accepted_without_effect() {
        let server = TestServer::start().await;
        let mut ws = server.connect_ws().await;
        let target_before = server.controls.rpm_target();

        ws.send(WsMessage::Text(
            r#"{"type":"replay","payload":{"mode":"seek","t_ms":2500}}"#.into(),
        ))
        .await
        .unwrap();

        // The connection keeps streaming and the engine target is untouched.
        let mut received = 0;
        while received < 3 {
            if let WsMessage::Text(_) = ws.next().await.unwrap().unwrap() {
                received += 1;
            }
        }
        assert_eq!(server.controls.rpm_target(), target_before);
    }

    #[tokio::test]
    async fn test_churning_clients_do_not_degrade_tick_rate() {
        let server = TestServer::start().await;

        // Metering queue registered directly in the session set: every
        // broadcast lands on it, making the achieved rate observable.
        let (meter_tx, mut meter_rx) = tokio::sync::mpsc::channel(256);
        server.sessions.register(meter_tx);

        let frames = Arc::new(AtomicU64::new(0));
        {
            let frames = Arc::clone(&frames);
            tokio::spawn(async move {
                while meter_rx.recv().await.is_some() {
                    frames.fetch_add(1, Ordering::Relaxed);
                }
            });
        }

        // 100 clients subscribe and immediately close in a tight loop
        // while the tick driver keeps broadcasting.
        let start = tokio::time::Instant::now();
        let counted_from = frames.load(Ordering::Relaxed);
        for _ in 0..100 {
            let ws = server.connect_ws().await;
            drop(ws);
        }

        // Measure over a full second for a stable rate figure.
        while start.elapsed() < Duration::from_secs(1) {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let elapsed = start.elapsed().as_secs_f64();
        let delivered = frames.load(Ordering::Relaxed) - counted_from;
        let rate = delivered as f64 / elapsed;

        // 10 ms tick period: the rate must hold within 5% of 100 Hz.
        assert!(
            (rate - 100.0).abs() <= 5.0,
            "broadcast rate {rate:.1} Hz drifted more than 5% under churn"
        );
    }
}
