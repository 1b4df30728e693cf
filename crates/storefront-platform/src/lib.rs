//! Durable client-side storage used by the session guard.

/// Session persistence in memory, in a file, or in the OS credential store.
pub mod session_store;

#[cfg(feature = "os-keyring")]
pub use session_store::KeyringSessionStore;
pub use session_store::{
    FileSessionStore, InMemorySessionStore, KEYRING_SERVICE, SessionStore, SessionStoreError,
    session_account,
};
