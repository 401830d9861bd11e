//! Error taxonomy for the marketplace core, and its HTTP mapping.
//!
//! Same status/message/source shape as the web framework crate's `AppError`,
//! but this crate has no dependency on it: the JSON body follows its own
//! envelope (`{success, message, errors?}`) instead.

use axum::{http::StatusCode, response::IntoResponse, response::Response, Json};
use serde::Serialize;
use thiserror::Error;

/// Errors raised by a domain aggregate or service before reaching HTTP.
#[derive(Error, Debug)]
pub enum DomainError {
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("not authenticated")]
    Unauthenticated,

    #[error("forbidden: {0}")]
    Forbidden(String),

    #[error("{resource} not found: {id}")]
    NotFound { resource: &'static str, id: String },

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("insufficient seats")]
    InsufficientSeats,

    #[error("insufficient luggage capacity")]
    InsufficientLuggage,

    #[error("insufficient wallet balance")]
    InsufficientBalance,

    #[error("illegal state transition: {0}")]
    IllegalTransition(String),

    #[error("cancellation window has passed: {0}")]
    CancellationWindowPassed(String),

    #[error("payment failed: {0}")]
    Payment(String),

    #[error("rate limited")]
    RateLimited,

    #[error("concurrent update, please retry")]
    ConcurrencyConflict,

    #[error(transparent)]
    Infra(#[from] anyhow::Error),
}

impl From<carpool_core::event_store::EventStoreError> for DomainError {
    fn from(err: carpool_core::event_store::EventStoreError) -> Self {
        match err {
            carpool_core::event_store::EventStoreError::ConcurrencyConflict { .. } => {
                Self::ConcurrencyConflict
            }
            other => Self::Infra(anyhow::anyhow!(other)),
        }
    }
}

/// Application error, mapped to the `{success:false, message, errors?}` envelope.
#[derive(Debug)]
pub struct AppError {
    status: StatusCode,
    message: String,
    errors: Option<Vec<String>>,
    source: Option<anyhow::Error>,
}

impl AppError {
    #[must_use]
    pub const fn new(status: StatusCode, message: String) -> Self {
        Self {
            status,
            message,
            errors: None,
            source: None,
        }
    }

    #[must_use]
    pub fn with_errors(mut self, errors: Vec<String>) -> Self {
        self.errors = Some(errors);
        self
    }

    #[must_use]
    pub fn with_source(mut self, source: anyhow::Error) -> Self {
        self.source = Some(source);
        self
    }
}

impl From<DomainError> for AppError {
    fn from(err: DomainError) -> Self {
        match err {
            DomainError::Validation(msg) => Self::new(StatusCode::BAD_REQUEST, msg),
            DomainError::Unauthenticated => {
                Self::new(StatusCode::UNAUTHORIZED, "authentication required".into())
            }
            DomainError::Forbidden(msg) => Self::new(StatusCode::FORBIDDEN, msg),
            DomainError::NotFound { resource, id } => Self::new(
                StatusCode::NOT_FOUND,
                format!("{resource} with id {id} not found"),
            ),
            DomainError::Conflict(msg) => Self::new(StatusCode::CONFLICT, msg),
            DomainError::ConcurrencyConflict => Self::new(
                StatusCode::CONFLICT,
                "this resource changed concurrently, please retry".into(),
            ),
            DomainError::InsufficientSeats => {
                Self::new(StatusCode::BAD_REQUEST, "not enough seats left".into())
            }
            DomainError::InsufficientLuggage => Self::new(
                StatusCode::BAD_REQUEST,
                "not enough luggage capacity left".into(),
            ),
            DomainError::InsufficientBalance => {
                Self::new(StatusCode::BAD_REQUEST, "insufficient wallet balance".into())
            }
            DomainError::IllegalTransition(msg) => Self::new(StatusCode::BAD_REQUEST, msg),
            DomainError::CancellationWindowPassed(msg) => {
                Self::new(StatusCode::BAD_REQUEST, msg)
            }
            DomainError::Payment(msg) => Self::new(StatusCode::PAYMENT_REQUIRED, msg),
            DomainError::RateLimited => {
                Self::new(StatusCode::TOO_MANY_REQUESTS, "too many requests".into())
            }
            DomainError::Infra(err) => {
                Self::new(StatusCode::INTERNAL_SERVER_ERROR, "internal error".into())
                    .with_source(err)
            }
        }
    }
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    success: bool,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    errors: Option<Vec<String>>,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        if self.status.is_server_error() {
            tracing::error!(
                status = %self.status,
                message = %self.message,
                error = ?self.source,
                "internal server error"
            );
        }
        let body = ErrorBody {
            success: false,
            message: self.message,
            errors: self.errors,
        };
        (self.status, Json(body)).into_response()
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        DomainError::Infra(err).into()
    }
}

/// Success envelope wrapping handler payloads: `{success:true, data, ...}`.
#[derive(Debug, Serialize)]
pub struct Envelope<T: Serialize> {
    pub success: bool,
    pub data: T,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pagination: Option<Pagination>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Pagination {
    pub page: u32,
    pub limit: u32,
    pub total: u64,
}

impl<T: Serialize> Envelope<T> {
    #[must_use]
    pub const fn ok(data: T) -> Self {
        Self {
            success: true,
            data,
            message: None,
            pagination: None,
        }
    }

    #[must_use]
    pub fn with_pagination(mut self, pagination: Pagination) -> Self {
        self.pagination = Some(pagination);
        self
    }

    #[must_use]
    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }
}

impl<T: Serialize> IntoResponse for Envelope<T> {
    fn into_response(self) -> Response {
        Json(self).into_response()
    }
}
