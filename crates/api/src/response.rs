//! Success envelope for API handlers.
//!
//! Every successful JSON body is `{ "data": ... }`; errors use the shape
//! produced by [`crate::error::AppError`].

use serde::Serialize;

/// `{ "data": T }`.
///
/// ```ignore
/// Ok(Json(DataResponse { data: entries }))
/// ```
#[derive(Debug, Serialize)]
pub struct DataResponse<T: Serialize> {
    pub data: T,
}
