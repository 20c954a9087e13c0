//! Request routing: the dynamic path multiplexer and the route manager that
//! installs backend handlers into it.

pub mod manager;
pub mod mux;

pub use manager::RouteManager;
pub use mux::{NotFoundHandler, PathMux, RouteHandler};
