use axum::{
    extract::Request,
    http::{HeaderMap, StatusCode},
    middleware::Next,
    response::Response,
};
use tracing::debug;

/// Identity headers set by the upstream auth proxy, in priority order.
/// `x-user` is the local development fallback.
pub const USER_HEADERS: &[&str] = &["x-vm-user", "x-forwarded-user", "x-user"];

const EMAIL_HEADERS: &[&str] = &["x-vm-email", "x-forwarded-email"];

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AuthenticatedUser {
    pub username: String,
    pub email: Option<String>,
}

fn first_header(headers: &HeaderMap, names: &[&str]) -> Option<String> {
    names
        .iter()
        .filter_map(|name| headers.get(*name))
        .filter_map(|value| value.to_str().ok())
        .map(str::trim)
        .find(|value| !value.is_empty())
        .map(str::to_string)
}

/// Rejects requests without an identity header with 401 and attaches
/// [`AuthenticatedUser`] to the rest.
pub async fn auth_middleware(mut req: Request, next: Next) -> Result<Response, StatusCode> {
    let Some(username) = first_header(req.headers(), USER_HEADERS) else {
        debug!(path = %req.uri().path(), "Rejected request without identity");
        return Err(StatusCode::UNAUTHORIZED);
    };
    let email = first_header(req.headers(), EMAIL_HEADERS);

    req.extensions_mut()
        .insert(AuthenticatedUser { username, email });

    Ok(next.run(req).await)
}
