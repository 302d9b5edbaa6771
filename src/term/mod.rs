//! Terminal state shared by both protocol ends.
//!
//! - **cell**: packed cell layout and color modes
//! - **shadow**: the cell-grid shadow store both ends keep in lockstep
//! - **snapshot**: run-length screen save/restore codec

pub mod cell;
pub mod shadow;
pub mod snapshot;

pub use cell::{Attrs, ColorMode, PackedCell};
pub use shadow::{RollDir, ShadowState};
