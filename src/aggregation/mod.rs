//! Discovery aggregation: merged `/apis` documents, per-group discovery and
//! the aggregator's own registration API.

pub mod apis;
pub mod documents;
pub mod registration_api;

pub use apis::{json_response, ApisHandler, GroupDiscoveryHandler};
pub use registration_api::{registration_group, RegistrationApi, REGISTRATION_GROUP, REGISTRATION_VERSION};
