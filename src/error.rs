//! Session-level error taxonomy.
//!
//! Per-module errors (`FrameError`, `ElementError`, `SnapshotError`) live
//! next to the code that raises them; this module folds them into the one
//! error type the session coordinators return.
//!
//! The split that matters operationally:
//!
//! - **fatal**: the connection is no longer trustworthy and the session
//!   must tear down (corrupted packet, serialization failure, handshake
//!   rejection, keepalive expiry, connection loss)
//! - **recoverable**: handled in place and never surfaced here (send
//!   buffer exhaustion latches and discards output, unknown element tags
//!   are logged and skipped, a canceled keyin still produces a reply)

use std::io;
use thiserror::Error;

use crate::proto::element::ElementError;
use crate::proto::frame::FrameError;
use crate::term::snapshot::SnapshotError;

#[derive(Error, Debug)]
pub enum SessionError {
    #[error("frame transport failed: {0}")]
    Frame(#[from] FrameError),

    #[error("malformed element payload: {0}")]
    Element(#[from] ElementError),

    #[error("screen restore failed: {0}")]
    Snapshot(#[from] SnapshotError),

    #[error("connection refused by server: {0}")]
    HandshakeRejected(String),

    #[error("server release {server} is newer than client release {client}")]
    VersionMismatch { server: u32, client: u32 },

    #[error("unexpected handshake reply: {0}")]
    HandshakeProtocol(String),

    #[error("no keepalive from peer within grace period")]
    KeepaliveExpired,

    #[error("peer closed the connection")]
    ConnectionClosed,

    #[error("socket error: {0}")]
    Io(#[from] io::Error),
}

pub type Result<T> = std::result::Result<T, SessionError>;
