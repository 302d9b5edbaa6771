//! Wire protocol layer.
//!
//! - **frame**: serial-stamped 16-byte ASCII headers around each payload
//! - **element**: the entity-escaped element trees inside the payloads

pub mod element;
pub mod frame;
