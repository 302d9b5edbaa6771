//! Engine side of the protocol.
//!
//! - **encoder**: display operations to element text, mirrored into a
//!   private shadow store so unchanged state is never re-sent
//! - **session**: framing, keyin requests, serial matching, keepalive

pub mod encoder;
pub mod session;
