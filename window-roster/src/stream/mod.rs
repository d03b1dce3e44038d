//! Live capture streaming.
//!
//! A [`LiveCaptureResourceManager`] owns a bounded pool of [`StreamSession`]s,
//! one per window being previewed. Every asynchronous transition is guarded by
//! an [`Epoch`] token so that late completions of superseded operations are
//! discarded instead of clobbering newer state.

pub mod epoch;
pub mod manager;
pub mod session;

pub use epoch::{Epoch, EpochToken};
pub use manager::LiveCaptureResourceManager;
pub use session::{SessionState, StreamSession};
