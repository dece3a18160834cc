pub mod deployments;
pub mod health;
pub mod requests;

use crate::{api_docs::ApiDoc, auth::auth_middleware, error::ApiError, state::AppState};
use axum::{middleware, Router};
use serde::Deserialize;
use std::str::FromStr;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use utoipa::{IntoParams, OpenApi};
use utoipa_swagger_ui::SwaggerUi;

pub fn create_app(state: AppState) -> Router {
    // Allow CORS for local development (frontend on different port)
    let cors = CorsLayer::permissive();

    Router::new()
        .merge(SwaggerUi::new("/swagger-ui").url("/api-docs/openapi.json", ApiDoc::openapi()))
        .merge(health::routes())
        .merge(
            requests::routes()
                .merge(deployments::routes())
                .layer(middleware::from_fn(auth_middleware)),
        )
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Query parameters of the list endpoints.
#[derive(Debug, Default, Deserialize, IntoParams)]
#[into_params(parameter_in = Query)]
pub struct ListParams {
    /// Only return entries in this status.
    pub status: Option<String>,
    /// 1-based page number.
    pub page: Option<u32>,
    /// Page size, at most 100.
    pub size: Option<u32>,
}

impl ListParams {
    fn status<T>(&self) -> Result<Option<T>, ApiError>
    where
        T: FromStr<Err = String>,
    {
        self.status
            .as_deref()
            .filter(|s| !s.is_empty())
            .map(|s| s.parse().map_err(ApiError::BadRequest))
            .transpose()
    }

    fn page(&self) -> u32 {
        self.page.unwrap_or(1)
    }

    fn size(&self) -> u32 {
        self.size.unwrap_or(0)
    }
}
