//! Per-Client WebSocket Session

use std::sync::Arc;

use axum::extract::ws::{Message, Utf8Bytes, WebSocket};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tracing::{debug, info};

use twin_physics::EngineControls;
use twin_protocol::{decode_client_frame, ClientCommand};

use crate::broadcast::{SessionSet, OUTBOUND_QUEUE_FRAMES};

/// Run one client session to completion.
///
/// The drive loop is spawned as its own task so the tick driver can abort
/// it through the session set; aborting releases every slot reference the
/// session holds, including a write stalled mid-frame. This frame stays
/// behind to deregister once the drive task ends, however it ends.
pub async fn run_session(
    socket: WebSocket,
    controls: Arc<EngineControls>,
    sessions: Arc<SessionSet>,
) {
    let (frames_tx, frames_rx) = mpsc::channel::<Utf8Bytes>(OUTBOUND_QUEUE_FRAMES);
    let id = sessions.register(frames_tx);
    info!(session = id, "client connected");

    let driver = tokio::spawn(drive_session(id, socket, frames_rx, controls));
    sessions.attach_abort(id, driver.abort_handle());

    match driver.await {
        Ok(()) => {}
        Err(e) if e.is_cancelled() => {
            debug!(session = id, "session aborted by backpressure or shutdown");
        }
        Err(e) => {
            debug!(session = id, error = %e, "session task failed");
        }
    }

    sessions.deregister(id);
    info!(session = id, "client disconnected");
}

/// The session's read/write loop.
///
/// Per-session FIFO delivery falls out of a single task draining its own
/// queue with at most one write in flight. Any read or write error, the
/// remote close, or the queue closing (eviction or server shutdown) ends
/// the loop.
async fn drive_session(
    id: u64,
    socket: WebSocket,
    mut frames_rx: mpsc::Receiver<Utf8Bytes>,
    controls: Arc<EngineControls>,
) {
    let (mut sink, mut stream) = socket.split();

    loop {
        tokio::select! {
            frame = frames_rx.recv() => {
                match frame {
                    Some(text) => {
                        if sink.send(Message::Text(text)).await.is_err() {
                            break;
                        }
                    }
                    // Sender dropped: evicted or server shutdown
                    None => break,
                }
            }
            inbound = stream.next() => {
                match inbound {
                    Some(Ok(Message::Text(text))) => {
                        handle_control_frame(text.as_str(), &controls, id);
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    // Binary frames are not part of the protocol; axum
                    // answers pings on its own.
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        debug!(session = id, error = %e, "websocket read error");
                        break;
                    }
                }
            }
        }
    }

    let _ = sink.close().await;
}

/// Apply one inbound control frame to the engine.
fn handle_control_frame(raw: &str, controls: &EngineControls, id: u64) {
    match decode_client_frame(raw) {
        Some(ClientCommand::SetRpm { rpm_target }) => {
            controls.set_rpm_target(rpm_target);
        }
        Some(ClientCommand::Replay { mode, t_ms }) => {
            // Recognized but deliberately not applied: freeze and scrub run
            // client-side against the client's own frame history.
            debug!(session = id, ?mode, ?t_ms, "replay request acknowledged");
        }
        None => {
            debug!(session = id, "dropping unrecognized frame");
        }
    }
}

#[cfg(test)]
mod tests {
    use twin_physics::{EngineConfig, PhysicsEngine};

    use super::*;

    #[test]
    fn test_set_rpm_frame_updates_target() {
        let engine = PhysicsEngine::new(EngineConfig::default());
        let controls = engine.controls();

        handle_control_frame(
            r#"{"type":"set_rpm","payload":{"rpm_target":3000}}"#,
            &controls,
            1,
        );
        assert_eq!(controls.rpm_target(), 3000.0);
    }

    #[test]
    fn test_set_rpm_frame_is_clamped() {
        let engine = PhysicsEngine::new(EngineConfig::default());
        let controls = engine.controls();

        handle_control_frame(
            r#"{"type":"set_rpm","payload":{"rpm_target":1e9}}"#,
            &controls,
            1,
        );
        assert_eq!(controls.rpm_target(), 8000.0);
    }

    #[test]
    fn test_replay_frame_does_not_touch_engine() {
        let engine = PhysicsEngine::new(EngineConfig::default());
        let controls = engine.controls();
        let before = controls.rpm_target();

        handle_control_frame(
            r#"{"type":"replay","payload":{"mode":"freeze"}}"#,
            &controls,
            1,
        );
        assert_eq!(controls.rpm_target(), before);
    }

    #[test]
    fn test_garbage_frames_are_dropped() {
        let engine = PhysicsEngine::new(EngineConfig::default());
        let controls = engine.controls();
        let before = controls.rpm_target();

        handle_control_frame("not json", &controls, 1);
        handle_control_frame(r#"{"type":"bogus"}"#, &controls, 1);
        assert_eq!(controls.rpm_target(), before);
    }
}
