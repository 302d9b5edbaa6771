//! Client side of the protocol.
//!
//! - **decoder**: received elements to shadow mutations and device calls
//! - **keyin**: the field editor driven by local key codes
//! - **session**: handshake, reader thread, keepalive and reply traffic

pub mod decoder;
pub mod keyin;
pub mod session;
