//! Outbound dialog lifecycle
//!
//! - [`DialogController`]: drives one INVITE to a terminal outcome under a deadline
//! - [`DialogHandle`]: the established dialog; sends the BYE exactly once
//! - [`DialogState`]: lifecycle states and their legal transitions

pub mod controller;
pub mod handle;
pub mod state;

pub use controller::{DialAttempt, DialogController};
pub use handle::{DialogHandle, DialogInfo, Termination};
pub use state::DialogState;
