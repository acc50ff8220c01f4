//! HTTP API exposing node state, cluster lifecycle and the event stream.
//!
//! # API Endpoints
//!
//! - `GET /healthz` - Liveness probe
//! - `GET /api/v1/status` - Daemon status snapshot
//! - `GET /api/v1/clusters/:cluster/nodes` - Cached node list with pod counts
//! - `GET /api/v1/clusters/:cluster/nodes/:node` - Full cached node object
//! - `GET /api/v1/clusters/health` - Circuit breaker state per cluster
//! - `POST /api/v1/clusters` - Register a cluster
//! - `POST /api/v1/clusters/:cluster/health/reset` - Clear breaker state
//! - `DELETE /api/v1/clusters/:cluster` - Unregister a cluster
//! - `GET /api/v1/stream` - WebSocket stream of node state changes

use core::error::Error;

pub mod handlers;
pub mod server;
pub mod stream;

/// API errors
#[derive(Debug, derive_more::Display)]
pub enum ApiError {
    #[display("Server error: {message}")]
    ServerError { message: String },
}

impl Error for ApiError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn api_error_display_formatting() {
        let server_error = ApiError::ServerError {
            message: "address already in use".to_string(),
        };
        assert_eq!(
            server_error.to_string(),
            "Server error: address already in use"
        );
    }
}
