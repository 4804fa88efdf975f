//! The caller's network address, used for quotas and audit logs.

use std::convert::Infallible;
use std::net::SocketAddr;

use axum::extract::{ConnectInfo, FromRequestParts};
use axum::http::request::Parts;

/// Address reported when the server was not started with connect info
/// (e.g. in tests driving the router directly).
pub const UNKNOWN_ADDRESS: &str = "unknown";

/// Peer IP of the TCP connection.
///
/// Forwarding headers are ignored: they are client-controlled and would
/// let a caller pick its own quota bucket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientIp(pub String);

impl<S: Send + Sync> FromRequestParts<S> for ClientIp {
    type Rejection = Infallible;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let ip = parts
            .extensions
            .get::<ConnectInfo<SocketAddr>>()
            .map(|ConnectInfo(addr)| addr.ip().to_string())
            .unwrap_or_else(|| UNKNOWN_ADDRESS.to_string());
        Ok(ClientIp(ip))
    }
}
