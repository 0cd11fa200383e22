//! Routing and admission
//!
//! Admission is decided before routing: a rejected task never reaches a
//! pool. Routing filters pools for eligibility, then applies the requested
//! strategy.

mod admission;
#[allow(clippy::module_inception)]
mod router;
mod strategy;

pub use admission::{AdmissionConfig, AdmissionController, AdmissionPermit};
pub use router::{RouteQuery, Router};
pub use strategy::RoutingStrategy;
