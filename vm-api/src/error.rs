use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use thiserror::Error;
use tracing::error;
use utoipa::ToSchema;
use vm_orchestrator::OrchestratorError;

pub type ApiResult<T> = Result<T, ApiError>;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("{0}")]
    BadRequest(String),

    #[error(transparent)]
    Orchestrator(#[from] OrchestratorError),
}

/// Error response body.
#[derive(Debug, Serialize, ToSchema)]
pub struct ErrorBody {
    pub error: String,
    pub kind: String,
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::Orchestrator(err) => match err {
                OrchestratorError::Validation(_) => StatusCode::BAD_REQUEST,
                OrchestratorError::NotFound(_) => StatusCode::NOT_FOUND,
                OrchestratorError::InvalidState(_) | OrchestratorError::AlreadyRunning(_) => {
                    StatusCode::CONFLICT
                }
                _ => StatusCode::INTERNAL_SERVER_ERROR,
            },
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::BadRequest(_) => "ValidationError",
            Self::Orchestrator(err) => err.kind(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            error!(kind = self.kind(), error = %self, "Request failed");
        }

        let body = ErrorBody {
            error: self.to_string(),
            kind: self.kind().to_string(),
        };
        (status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vm_gateway::GatewayError;

    #[test]
    fn test_status_mapping() {
        let cases = [
            (OrchestratorError::Validation("bad".into()), StatusCode::BAD_REQUEST),
            (OrchestratorError::NotFound("x".into()), StatusCode::NOT_FOUND),
            (OrchestratorError::InvalidState("x".into()), StatusCode::CONFLICT),
            (OrchestratorError::AlreadyRunning("x".into()), StatusCode::CONFLICT),
            (
                OrchestratorError::Gateway(GatewayError::EnvironmentUnavailable("down".into())),
                StatusCode::INTERNAL_SERVER_ERROR,
            ),
        ];

        for (err, expected) in cases {
            assert_eq!(ApiError::from(err).status(), expected);
        }
        assert_eq!(
            ApiError::BadRequest("page".into()).status(),
            StatusCode::BAD_REQUEST
        );
    }

    #[test]
    fn test_kind_comes_from_the_engine() {
        let err = ApiError::from(OrchestratorError::AlreadyRunning("request r-1".into()));
        assert_eq!(err.kind(), "AlreadyRunningError");
        assert_eq!(ApiError::BadRequest("x".into()).kind(), "ValidationError");
    }
}
