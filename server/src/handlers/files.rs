//! Serving produced videos.

use axum::extract::{Path, Query, State};
use axum::http::header;
use axum::response::{IntoResponse, Response};
use peoplespot_core::session::is_output_file_name;
use serde::Deserialize;
use tracing::debug;

use crate::error::{ApiError, ApiResult};
use crate::state::AppState;

#[derive(Debug, Default, Deserialize)]
pub struct FileQuery {
    pub download: Option<String>,
}

impl FileQuery {
    fn wants_attachment(&self) -> bool {
        matches!(self.download.as_deref(), Some("1" | "true"))
    }
}

/// `GET /files/:name`.  Only files registered by this process are served.
pub async fn serve_file(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Query(query): Query<FileQuery>,
) -> ApiResult<Response> {
    if !is_output_file_name(&name) {
        return Err(ApiError::not_found(format!("no such file: {name}")));
    }
    let path = state
        .session
        .files()
        .find_by_name(&name)
        .ok_or_else(|| ApiError::not_found(format!("no such file: {name}")))?;

    let bytes = match tokio::fs::read(&path).await {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(ApiError::not_found(format!("no such file: {name}")));
        }
        Err(e) => return Err(e.into()),
    };
    debug!(path = %path.display(), bytes = bytes.len(), "serving output video");

    let mut response = ([(header::CONTENT_TYPE, "video/mp4")], bytes).into_response();
    if query.wants_attachment() {
        let disposition = format!("attachment; filename=\"{name}\"");
        if let Ok(value) = disposition.parse() {
            response
                .headers_mut()
                .insert(header::CONTENT_DISPOSITION, value);
        }
    }
    Ok(response)
}
