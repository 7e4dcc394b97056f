use axum::{
    Router,
    body::Body,
    extract::{Path, Query, Request, State},
    response::Response,
    routing::get,
};
use serde::Deserialize;
use tower::ServiceExt;
use tower_http::services::ServeFile;
use utoipa::IntoParams;

use crate::error::{Error, Result};

use super::SharedState;

#[derive(Debug, Deserialize, IntoParams)]
#[into_params(parameter_in = Query)]
pub struct SignedLink {
    /// Unix timestamp after which the link is dead
    pub expires: i64,
    pub signature: String,
}

#[utoipa::path(
    path = "/media/{key}",
    method(get),
    params(
        ("key" = String, Path, description = "Storage key, e.g. videos/abc.mp4"),
        SignedLink
    ),
    responses(
        (status = 200, description = "File content"),
        (status = 206, description = "Requested byte range"),
        (status = 403, description = "Link forged or expired"),
        (status = 404, description = "File not found")
    )
)]
pub async fn serve(
    State(state): State<SharedState>,
    Path(key): Path<String>,
    Query(link): Query<SignedLink>,
    request: Request,
) -> Result<Response> {
    state.storage.verify(&key, link.expires, &link.signature)?;
    let path = state.storage.path(&key)?;
    if !tokio::fs::try_exists(&path).await? {
        return Err(Error::not_found(format!("Media {key}")));
    }
    let Ok(response) = ServeFile::new(path).oneshot(request).await;
    Ok(response.map(Body::new))
}

pub fn routes() -> Router<SharedState> {
    Router::new().route("/media/{*key}", get(serve))
}
