//! Control Plane Client
//!
//! HTTP/JSON API of the central service that owns node identity and the
//! authorized-user list.

mod client;
pub mod types;

pub use client::{ControlPlane, HttpControlPlane};
pub use types::{
    ControlPlaneError, HealthReport, RegisterRequest, RemoteUser, TrafficRecord, TrafficReport,
};
