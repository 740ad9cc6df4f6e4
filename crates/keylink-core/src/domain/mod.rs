//! Device vocabulary shared by the codec and the host.
//!
//! - **`application`** – on-device applications: their AIDs, the capability
//!   bit set the management application reports, and the session kinds
//!   clients can request.
//! - **`device`** – physical interfaces, form factors and firmware versions.

pub mod application;
pub mod device;

pub use application::{Aid, Capability, SessionKind};
pub use device::{FormFactor, Interface, Version};
