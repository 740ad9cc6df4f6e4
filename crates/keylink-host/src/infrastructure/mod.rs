//! Infrastructure layer for the host.
//!
//! Contains the adapters at the edge of the process: the link to the key and
//! file-system storage for the host configuration.
//!
//! **Dependency rule**: this layer may depend on `keylink_core`, but the
//! `application` layer only sees it through the [`transport::Transport`]
//! trait.

pub mod storage;
pub mod transport;
