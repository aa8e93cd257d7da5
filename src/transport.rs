//! Request execution: correlation IDs, auth headers, caching, retry with
//! backoff, endpoint fallback and offline queuing.

pub mod auth;
pub mod backend;
pub mod error;
pub mod executor;
pub mod request;

pub use auth::{is_auth_failure, Anonymous, AuthProvider, StaticToken};
pub use backend::{BackendError, HttpBackend, HttpCall, HttpReply, ReqwestBackend};
pub use error::{user_message, ErrorKind, TransportError};
pub use executor::{TransportDeps, TransportExecutor};
pub use request::{ApiRequest, ApiResponse, Method, ResponseSource};
