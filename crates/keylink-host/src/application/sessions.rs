//! Typed wrappers over [`SessionHandle`], one per application.
//!
//! The wrappers carry no protocol logic of their own; they only make the
//! kind part of the type so a PIV handle cannot be passed where an OATH one is
//! expected.  They deref to the underlying handle, so raw
//! [`transceive`](SessionHandle::transceive) stays available.

use std::future::Future;
use std::ops::Deref;

use keylink_core::SessionKind;

use super::arbiter::{Connection, SessionError, SessionHandle};

/// A session wrapper bound to one [`SessionKind`].
pub trait TypedSession: Sized + Send + 'static {
    const KIND: SessionKind;

    /// Wraps `handle` without checking its kind.
    fn from_handle(handle: SessionHandle) -> Self;

    fn handle(&self) -> &SessionHandle;

    fn into_handle(self) -> SessionHandle;

    /// Wraps `handle` if it was granted for [`Self::KIND`].
    fn try_from_handle(handle: SessionHandle) -> Result<Self, SessionHandle> {
        if handle.kind() == Self::KIND {
            Ok(Self::from_handle(handle))
        } else {
            Err(handle)
        }
    }
}

impl Connection {
    /// Requests a session of `S::KIND` and wraps it.
    ///
    /// The request is queued before this returns.
    pub fn open<S: TypedSession>(&self) -> impl Future<Output = Result<S, SessionError>> {
        let completion = self.request_session(S::KIND);
        async move { completion.await.map(S::from_handle) }
    }
}

macro_rules! typed_session {
    ($(#[$meta:meta])* $name:ident => $kind:expr) => {
        $(#[$meta])*
        #[derive(Debug, Clone)]
        pub struct $name {
            handle: SessionHandle,
        }

        impl TypedSession for $name {
            const KIND: SessionKind = $kind;

            fn from_handle(handle: SessionHandle) -> Self {
                Self { handle }
            }

            fn handle(&self) -> &SessionHandle {
                &self.handle
            }

            fn into_handle(self) -> SessionHandle {
                self.handle
            }
        }

        impl Deref for $name {
            type Target = SessionHandle;

            fn deref(&self) -> &SessionHandle {
                &self.handle
            }
        }
    };
}

typed_session!(
    /// Credential store (OATH TOTP/HOTP).
    OathSession => SessionKind::Oath
);
typed_session!(
    /// One-time password slots.
    OtpSession => SessionKind::Otp
);
typed_session!(U2fSession => SessionKind::U2f);
typed_session!(Fido2Session => SessionKind::Fido2);
typed_session!(
    /// Certificate store.
    PivSession => SessionKind::Piv
);
typed_session!(
    /// HMAC challenge-response.  Shares its AID with [`OtpSession`].
    ChallengeResponseSession => SessionKind::ChallengeResponse
);

// ── Tests ─────────────────────────────────────────────────────────────────────
