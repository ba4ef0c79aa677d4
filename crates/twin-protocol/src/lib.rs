//! Digital Twin Wire Protocol
//!
//! JSON text-frame codec between the twin server and dashboard clients.
//! Outbound state frames are formatted once per tick into a pooled byte
//! region; inbound control frames are parsed into [`ClientCommand`].

mod codec;
mod state;

pub use codec::{decode_client_frame, encode_state, ClientCommand, ReplayMode};
pub use state::StatePayload;
