//! Reconciliation of registry state into installed routes.

pub mod queue;
pub mod rate_limiter;
pub mod registration;

pub use queue::WorkQueue;
pub use rate_limiter::ItemExponentialBackoff;
pub use registration::{BackendHandlerManager, RegistrationController};
