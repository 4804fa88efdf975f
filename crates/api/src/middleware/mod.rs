//! Request extractors and middleware.
//!
//! - [`client_ip::ClientIp`]: the caller's network address.
//! - [`license::LicenseTier`]: the caller's verified license, free by default.
//! - [`automation::ExternalAgent`]: bearer auth for the automation API.
//! - [`rate_limit::rate_limit`]: per-address request ceiling.
//! - [`security_headers`]: hardening headers on every response.

pub mod automation;
pub mod client_ip;
pub mod license;
pub mod rate_limit;

use axum::http::{HeaderName, HeaderValue};
use tower_http::set_header::SetResponseHeaderLayer;

/// Static hardening headers applied to every response.
pub fn security_headers() -> [SetResponseHeaderLayer<HeaderValue>; 3] {
    [
        SetResponseHeaderLayer::overriding(
            HeaderName::from_static("x-content-type-options"),
            HeaderValue::from_static("nosniff"),
        ),
        SetResponseHeaderLayer::overriding(
            HeaderName::from_static("x-frame-options"),
            HeaderValue::from_static("DENY"),
        ),
        SetResponseHeaderLayer::overriding(
            HeaderName::from_static("referrer-policy"),
            HeaderValue::from_static("strict-origin-when-cross-origin"),
        ),
    ]
}
