use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;

use crate::handler::HandlerError;

// Taken from https://github.com/tokio-rs/axum/blob/main/examples/anyhow-error-response/src/main.rs
#[derive(Debug)]
pub struct ServingError {
    pub status: StatusCode,
    pub message: HttpErrorResponse,
}

#[derive(Debug, Serialize)]
pub struct HttpErrorResponse {
    error: String,
}

impl From<String> for HttpErrorResponse {
    fn from(message: String) -> Self {
        HttpErrorResponse { error: message }
    }
}

impl From<&str> for HttpErrorResponse {
    fn from(message: &str) -> Self {
        HttpErrorResponse {
            error: message.to_string(),
        }
    }
}

impl IntoResponse for ServingError {
    fn into_response(self) -> Response {
        let mut res = Json(self.message).into_response();
        *res.status_mut() = self.status;
        res
    }
}

impl<E> From<E> for ServingError
where
    E: Into<anyhow::Error>,
{
    fn from(err: E) -> Self {
        let err = err.into();
        let status = err
            .downcast_ref::<HandlerError>()
            .map_or(StatusCode::INTERNAL_SERVER_ERROR, status_for);
        ServingError {
            status,
            message: HttpErrorResponse::from(err.to_string()),
        }
    }
}

fn status_for(err: &HandlerError) -> StatusCode {
    match err {
        HandlerError::BatchSize { .. }
        | HandlerError::InvalidPayload(_)
        | HandlerError::InvalidParameter(_) => StatusCode::BAD_REQUEST,
        HandlerError::NotReady(_) => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

pub type ServingResult<T, E = ServingError> = Result<T, E>;

#[macro_export]
macro_rules! bail_serving {
    ($error_message:expr) => {
        return Err($crate::error::ServingError { status: StatusCode::INTERNAL_SERVER_ERROR, message: $crate::error::HttpErrorResponse::from($error_message) })
    };
    ($status_code:expr, $error_message:expr) => {
        return Err($crate::error::ServingError { status: $status_code, message: $crate::error::HttpErrorResponse::from($error_message) })
    };
    ($status:expr, $fmt:expr $(, $arg:expr)*) => {
        return Err($crate::error::ServingError {
            status: $status,
            message: $crate::error::HttpErrorResponse::from(format!($fmt $(, $arg)*)),
        })
    };
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::HandlerState;

    #[test]
    fn handler_errors_map_to_client_statuses() {
        let err = ServingError::from(HandlerError::BatchSize {
            expected: 1,
            actual: 4,
        });
        assert_eq!(err.status, StatusCode::BAD_REQUEST);

        let err = ServingError::from(HandlerError::NotReady(HandlerState::Failed));
        assert_eq!(err.status, StatusCode::SERVICE_UNAVAILABLE);
    }

    #[test]
    fn other_errors_are_internal() {
        let err = ServingError::from(anyhow::anyhow!("weights went missing"));
        assert_eq!(err.status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(err.message.error, "weights went missing");
    }
}
