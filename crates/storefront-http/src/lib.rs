//! HTTP side of the storefront client: transports, the session guard and
//! the query/REST clients built on it.

pub mod anti_forgery;
pub mod config;
pub mod guard;
pub mod query;
pub mod rest;
pub mod transport;

pub use anti_forgery::{AntiForgerySource, CookieTokenSource, StaticTokenSource};
pub use config::{AuthEndpoints, BackendConfig, CredentialsMode, DEFAULT_TIMEOUT, HandshakeConfig};
pub use guard::{Backend, BackendRoute, SessionGuard};
pub use query::QueryClient;
pub use rest::RestClient;
pub use transport::{
    OutgoingRequest, RequestBody, ReqwestTransport, Transport, TransportError, TransportResponse,
};
