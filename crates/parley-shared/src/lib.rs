// Shared types, crypto primitives, and wire protocol for the Parley engine.

pub mod constants;
pub mod crypto;
pub mod error;
pub mod identity;
pub mod protocol;
pub mod types;

pub use error::{CryptoError, IdentityError, ParleyError, ProtocolError};
pub use identity::{Identity, IdentityExport};
pub use types::{PeerStatus, Role, SessionPhase, UserId};
