//! # keylink-host
//!
//! The asynchronous side of keylink: one arbiter task per physical link that
//! hands out application sessions, serialises every exchange, and retires
//! stale handles.
//!
//! - **`application`** – the arbiter, typed session wrappers, and the
//!   management read/write use case.
//! - **`infrastructure`** – the [`Transport`](infrastructure::transport::Transport)
//!   boundary, an in-process simulated key, and TOML configuration.

pub mod application;
pub mod infrastructure;
