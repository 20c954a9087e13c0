//! The aggregator server: wiring of registry, controller, routes and the
//! HTTP front end.

pub mod server;

pub use server::AggregatorServer;
