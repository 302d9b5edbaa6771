//! Smart-client remote terminal protocol.
//!
//! Both ends of a legacy "smart client" terminal session:
//!
//! - **proto**: wire framing (serial-stamped ASCII headers) and the
//!   entity-escaped element trees carried inside each frame
//! - **term**: the packed-cell shadow store kept byte-identical on both
//!   ends, plus the run-length snapshot codec used for save/restore
//! - **server**: engine-side command encoder and session coordinator
//! - **client**: element decoder, keyin field editor, and the client
//!   session loop with its background reader thread
//!
//! # Architecture
//!
//! ```text
//! engine                              client
//! ServerSession                       ClientSession
//! ├── Encoder ── ShadowState          ├── Decoder ── ShadowState
//! └── FrameConn ═══ tcp (framed) ═══  ├── FrameConn (+ reader thread)
//!                                     └── KeyinField
//! ```

pub mod client;
pub mod config;
pub mod error;
pub mod keys;
pub mod proto;
pub mod server;
pub mod term;
