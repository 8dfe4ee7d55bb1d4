//! HTTP error mapping
//!
//! Every failure is answered with a small JSON envelope carrying the status
//! code and a fixed message. Internal causes are logged, never returned.

use crate::error::Error;
use crate::telegram::UpstreamError;

use axum::{
    http::{header, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use tracing::{debug, error, warn};

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub(crate) struct ErrorEnvelope {
    pub(crate) code: u16,
    pub(crate) message: String,
}

pub(crate) fn message_for_status(status: StatusCode) -> &'static str {
    match status {
        StatusCode::UNAUTHORIZED => "unauthorized",
        StatusCode::FORBIDDEN => "forbidden",
        StatusCode::NOT_FOUND => "not found",
        StatusCode::RANGE_NOT_SATISFIABLE => "range not satisfiable",
        StatusCode::TOO_MANY_REQUESTS => "too many requests",
        StatusCode::BAD_GATEWAY => "bad gateway",
        StatusCode::SERVICE_UNAVAILABLE => "service unavailable",
        StatusCode::INTERNAL_SERVER_ERROR => "internal server error",
        _ => "request failed",
    }
}

pub(crate) fn status_with_message(status: StatusCode) -> (StatusCode, Json<ErrorEnvelope>) {
    (
        status,
        Json(ErrorEnvelope {
            code: status.as_u16(),
            message: message_for_status(status).to_string(),
        }),
    )
}

pub(crate) fn status_for_error(err: &Error) -> StatusCode {
    match err {
        Error::NotFound(_) | Error::TokenDecode(_) | Error::Upstream(UpstreamError::NotFound) => {
            StatusCode::NOT_FOUND
        }
        Error::Unauthorized => StatusCode::UNAUTHORIZED,
        Error::AdmissionRejected => StatusCode::TOO_MANY_REQUESTS,
        Error::RangeNotSatisfiable { .. } => StatusCode::RANGE_NOT_SATISFIABLE,
        Error::Upstream(_) => StatusCode::BAD_GATEWAY,
        Error::PoolClosed | Error::Cancelled => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let status = status_for_error(&self);
        match status {
            StatusCode::NOT_FOUND | StatusCode::UNAUTHORIZED | StatusCode::TOO_MANY_REQUESTS => {
                debug!(status = status.as_u16(), "Request rejected: {}", self);
            }
            StatusCode::INTERNAL_SERVER_ERROR => {
                error!(status = status.as_u16(), "Request failed: {}", self);
            }
            _ => warn!(status = status.as_u16(), "Request failed: {}", self),
        }

        let mut response = status_with_message(status).into_response();
        if let Error::RangeNotSatisfiable { size } = self {
            if let Ok(value) = HeaderValue::from_str(&format!("bytes */{}", size)) {
                response.headers_mut().insert(header::CONTENT_RANGE, value);
            }
        }
        response
    }
}
