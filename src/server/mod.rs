//! Server-side collaboration engine.
//!
//! The pieces compose the same way a deployment does: a gateway accepts a
//! transport, hands it to [`session::serve`] with a [`auth::TokenVerifier`],
//! and the session registers with the shared [`hub::SceneHub`], which owns
//! the rooms, the version gate, presence, and delta coalescing on top of a
//! [`store::SceneStore`].

pub mod auth;
pub mod coalesce;
pub mod hub;
pub mod presence;
pub mod session;
pub mod store;

pub use auth::{AuthError, Principal, StaticTokenVerifier, TokenVerifier};
pub use coalesce::{DeltaCoalescer, COALESCE_WINDOW};
pub use hub::{HubError, SceneHub};
pub use presence::PresenceRoster;
pub use session::{serve, HANDSHAKE_TIMEOUT};
pub use store::{MemoryStore, SceneStore, StoreError};
