//! Authentication of incoming requests.

pub mod middleware;

pub use middleware::{authenticate, TokenAuthenticator};
