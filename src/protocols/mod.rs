//! Backend protocol handling: the per-backend reverse proxy, the transports
//! it uses and caller identity propagation.

pub mod identity;
pub mod proxy;
pub mod transport;

pub use identity::{default_identity_accessor, user_from_extensions, IdentityAccessor, IdentityPropagation};
pub use proxy::ProxyHandler;
pub use transport::{BackendTls, ProxySettings, Transport};
