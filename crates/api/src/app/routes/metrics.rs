use std::sync::Arc;

use axum::{
    Json,
    extract::{Extension, Path},
    http::StatusCode,
    response::IntoResponse,
};

use devpulse_core::RepositoryId;

use crate::app::errors;
use crate::app::routes::blocking;
use crate::app::services::AppServices;

/// Stored team metrics snapshots for one repository, oldest first.
pub async fn team_metrics(
    Extension(services): Extension<Arc<AppServices>>,
    Path(id): Path<String>,
) -> axum::response::Response {
    let repository_id: RepositoryId = match id.parse() {
        Ok(id) => id,
        Err(e) => {
            return errors::json_error(
                StatusCode::BAD_REQUEST,
                "invalid_repository_id",
                format!("{e}"),
            );
        }
    };

    let metrics = services.metrics.clone();
    match blocking(move || metrics.team_metrics(repository_id)).await {
        Ok(Ok(records)) => Json(records).into_response(),
        Ok(Err(e)) => errors::store_error_to_response(e),
        Err(resp) => resp,
    }
}
