//! The `bus` module is the core of the message bus.
//!
//! It routes published messages from publishers to their receivers through
//! the embedded broker, archives them per publisher, and hands them to
//! receivers either by polling or by push over a live connection.

pub mod engine;
pub mod route;
pub mod router;

pub use engine::Bus;
pub use route::{Route, RouteDiff, RouteTable};
pub use router::Router;

#[cfg(test)]
mod tests;
