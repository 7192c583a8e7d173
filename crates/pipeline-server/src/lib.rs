//! # Pipeline Server
//!
//! HTTP surface for the clinical pipeline.
//!
//! - `POST /v1/pipeline/run` runs the pipeline and returns the result
//! - `POST /v1/jobs` and `GET /v1/jobs/:job_id` for background runs
//! - `GET /health`, `GET /health/upstreams` and `GET /metrics`
//! - `GET /v1/circuits` and `POST /v1/circuits/:target/reset`
//!
//! Caller identity arrives in `x-user-id`, `x-user-role` and
//! `x-institution-id` headers set by the fronting auth proxy.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod error;
pub mod extractors;
pub mod handlers;
pub mod routes;
pub mod server;
pub mod shutdown;
pub mod state;

pub use error::ApiError;
pub use routes::create_router;
pub use server::{Server, ServerConfig, ServerError};
pub use shutdown::shutdown_signal;
pub use state::{AppState, AppStateBuilder};
