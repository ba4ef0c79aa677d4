//! State Frame Encoder and Control Frame Decoder

use std::io::{Cursor, Write};

use serde::Deserialize;

use crate::StatePayload;

/// Encode a state payload as the outbound JSON text frame.
///
/// Writes `{"type":"state","payload":{...}}` directly into `buf` and
/// returns the number of bytes written, or 0 when the region is too small.
/// Key order and per-field fractional precision are part of the wire
/// contract, so the frame is formatted by hand rather than through
/// `serde_json`.
pub fn encode_state(state: &StatePayload, buf: &mut [u8]) -> usize {
    let mut cursor = Cursor::new(buf);
    let written = write!(
        cursor,
        "{{\"type\":\"state\",\"payload\":{{\
         \"rpm\":{rpm:.2},\
         \"angle_rad\":{angle_rad:.6},\
         \"stress_pa\":{stress_pa:.2},\
         \"stress_factor\":{stress_factor:.6},\
         \"piston_force_n\":{piston_force_n:.2},\
         \"rod_force_n\":{rod_force_n:.2},\
         \"tangential_force_n\":{tangential_force_n:.2},\
         \"torque_nm\":{torque_nm:.4},\
         \"side_thrust_n\":{side_thrust_n:.2},\
         \"timestamp_ms\":{timestamp_ms}}}}}",
        rpm = state.rpm,
        angle_rad = state.angle_rad,
        stress_pa = state.stress_pa,
        stress_factor = state.stress_factor,
        piston_force_n = state.piston_force_n,
        rod_force_n = state.rod_force_n,
        tangential_force_n = state.tangential_force_n,
        torque_nm = state.torque_nm,
        side_thrust_n = state.side_thrust_n,
        timestamp_ms = state.timestamp_ms,
    );

    match written {
        Ok(()) => cursor.position() as usize,
        Err(_) => 0,
    }
}

/// Replay playback mode requested by a client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReplayMode {
    Live,
    Freeze,
    Seek,
}

/// Parsed inbound control frame.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum ClientCommand {
    /// Request a new RPM target. Clamped at the engine boundary, not here.
    SetRpm { rpm_target: f64 },
    /// Replay transition. Recognized on the wire; the server does not
    /// mutate engine state for it (replay is served client-side).
    Replay {
        mode: ReplayMode,
        #[serde(default)]
        t_ms: Option<u64>,
    },
}

/// Parse an inbound text frame.
///
/// Malformed JSON, a missing field, a non-numeric `rpm_target`, or an
/// unrecognized `type` all yield `None`; such frames are dropped silently.
pub fn decode_client_frame(raw: &str) -> Option<ClientCommand> {
    serde_json::from_str(raw).ok()
}
