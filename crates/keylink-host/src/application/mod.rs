//! Application layer: sessions over a shared link.
//!
//! # How the pieces fit (for beginners)
//!
//! A caller holds a [`Connection`](arbiter::Connection).  Asking it for a
//! session queues a request with the connection's arbiter task, which SELECTs
//! the application and hands back a [`SessionHandle`](arbiter::SessionHandle).
//! Commands sent through the handle are queued with the same task, so all
//! traffic to the key goes through one place in one order.
//!
//! - **`arbiter`** – the connection task, session handles, and the error type.
//! - **`sessions`** – typed wrappers, one per application.
//! - **`management`** – reading and writing the device configuration.

pub mod arbiter;
pub mod management;
pub mod sessions;

pub use arbiter::{
    ArbiterOptions, Completion, Connection, ConnectionId, ProtocolError, SessionError,
    SessionHandle,
};
pub use management::{ManagementSession, WriteOutcome};
pub use sessions::{
    ChallengeResponseSession, Fido2Session, OathSession, OtpSession, PivSession, TypedSession,
    U2fSession,
};
