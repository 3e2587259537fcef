//! Operator and dashboard APIs.
//!
//! [`AdminApi`] carries the commands that change campaigns and place calls,
//! [`SupervisorApi`] the read-only monitoring surface. [`http::router`]
//! exposes both over JSON REST.

pub mod admin;
pub mod http;
pub mod supervisor;

pub use admin::AdminApi;
pub use http::{router, ApiState};
pub use supervisor::SupervisorApi;
