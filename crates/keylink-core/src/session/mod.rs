//! Session bookkeeping shared by every session kind.
//!
//! - **`generation`** – the counter that retires stale handles.
//! - **`state`** – the lifecycle a single session moves through.

pub mod generation;
pub mod state;

pub use generation::{Generation, GenerationCounter};
pub use state::{SessionState, SessionStateCell};
