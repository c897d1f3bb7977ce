//! Running the pipeline on an uploaded video.

use std::path::Path;

use axum::Json;
use axum::extract::{Multipart, State};
use axum::extract::multipart::Field;
use peoplespot_core::pipeline::validate_threshold;
use peoplespot_core::session::Prediction;
use peoplespot_core::video::probe;
use serde::Serialize;
use tempfile::NamedTempFile;
use tokio::io::AsyncWriteExt;
use tracing::{info, warn};

use crate::error::{ApiError, ApiResult};
use crate::state::{AppState, lock_detector};

#[derive(Debug, Serialize)]
pub struct PredictResponse {
    /// Inline playback URL
    pub video: String,
    /// Same file, served as an attachment
    pub download: String,
    pub frames: u64,
    pub fps: f64,
}

/// `POST /api/predict` with multipart fields `video` (file) and `conf`
/// (optional float).
pub async fn predict(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> ApiResult<Json<PredictResponse>> {
    let mut upload: Option<NamedTempFile> = None;
    let mut conf: Option<f32> = None;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ApiError::bad_request(format!("malformed multipart body: {e}")))?
    {
        let name = field.name().map(str::to_owned);
        match name.as_deref() {
            Some("video") => upload = Some(spool_upload(field).await?),
            Some("conf") => {
                let text = field
                    .text()
                    .await
                    .map_err(|e| ApiError::bad_request(format!("unreadable conf field: {e}")))?;
                conf = Some(parse_confidence(&text)?);
            }
            Some(other) => warn!(field = other, "ignoring unknown multipart field"),
            None => {}
        }
    }

    let upload = upload.ok_or_else(|| ApiError::bad_request("no video uploaded"))?;
    let threshold = validate_threshold(conf.unwrap_or(state.config.default_confidence))
        .map_err(|e| ApiError::bad_request(e.to_string()))?;

    let session = state.session.clone();
    let detector = state.detector.clone();
    let prediction = tokio::task::spawn_blocking(move || -> ApiResult<_> {
        let input = upload.path();
        check_readable(input)?;

        let mut detector = lock_detector(&detector);
        let prediction = session.predict(input, &mut **detector, threshold, &mut |_, _| {})?;
        drop(upload);
        Ok(prediction)
    })
    .await??;

    let response = PredictResponse::from_prediction(prediction)?;
    info!(video = %response.video, frames = response.frames, threshold, "prediction finished");
    Ok(Json(response))
}

impl PredictResponse {
    /// Both output slots point at the one produced file.  No file means the
    /// upload decoded to zero frames.
    fn from_prediction(prediction: Option<Prediction>) -> ApiResult<Self> {
        let prediction = prediction.ok_or_else(|| {
            ApiError::NoOutput("the uploaded video contains no decodable frames".into())
        })?;
        let name = prediction.file_name();
        Ok(Self {
            video: format!("/files/{name}"),
            download: format!("/files/{name}?download=1"),
            frames: prediction.summary.frames,
            fps: prediction.summary.fps(),
        })
    }
}

/// Stream an upload field into a temporary file, keeping the client's
/// extension so the demuxer can use it as a hint.
async fn spool_upload(mut field: Field<'_>) -> ApiResult<NamedTempFile> {
    let suffix = field
        .file_name()
        .and_then(|n| Path::new(n).extension())
        .and_then(|ext| ext.to_str())
        .map(|ext| format!(".{ext}"))
        .unwrap_or_default();

    let tmp = tempfile::Builder::new()
        .prefix("upload_")
        .suffix(&suffix)
        .tempfile()?;
    let mut out = tokio::fs::File::from_std(tmp.reopen()?);

    let mut bytes = 0usize;
    while let Some(chunk) = field
        .chunk()
        .await
        .map_err(|e| ApiError::bad_request(format!("upload interrupted: {e}")))?
    {
        bytes += chunk.len();
        out.write_all(&chunk).await?;
    }
    out.flush().await?;

    if bytes == 0 {
        return Err(ApiError::bad_request("no video uploaded"));
    }
    info!(bytes, path = %tmp.path().display(), "upload spooled");
    Ok(tmp)
}

fn parse_confidence(text: &str) -> ApiResult<f32> {
    let text = text.trim();
    let conf: f32 = text
        .parse()
        .map_err(|_| ApiError::bad_request(format!("conf must be a number, got {text:?}")))?;
    validate_threshold(conf).map_err(|e| ApiError::bad_request(e.to_string()))
}

/// An input the demuxer cannot open is the client's fault.
fn check_readable(input: &Path) -> ApiResult<()> {
    probe(input)
        .map(|_| ())
        .map_err(|e| ApiError::bad_request(format!("unreadable video: {e:#}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    use peoplespot_core::pipeline::RunSummary;
    use peoplespot_core::video::Rational;

    #[test]
    fn no_prediction_is_unprocessable() {
        let err = PredictResponse::from_prediction(None).unwrap_err();
        assert!(matches!(err, ApiError::NoOutput(_)));
        assert_eq!(err.status_code(), axum::http::StatusCode::UNPROCESSABLE_ENTITY);
    }

    #[test]
    fn both_slots_bind_to_the_produced_file() {
        let prediction = Prediction {
            path: "/srv/out/preds_x.mp4".into(),
            summary: RunSummary {
                frames: 3,
                detections: 2,
                width: 640,
                height: 480,
                frame_rate: Rational::new(10, 1),
            },
        };
        let response = PredictResponse::from_prediction(Some(prediction)).unwrap();
        assert_eq!(response.video, "/files/preds_x.mp4");
        assert_eq!(response.download, "/files/preds_x.mp4?download=1");
        assert_eq!(response.frames, 3);
        assert_eq!(response.fps, 10.0);
    }

    #[test]
    fn confidence_must_be_a_number_in_range() {
        assert_eq!(parse_confidence(" 0.3 ").unwrap(), 0.3);
        assert_eq!(parse_confidence("1").unwrap(), 1.0);
        assert!(matches!(parse_confidence("abc"), Err(ApiError::BadRequest(_))));
        assert!(matches!(parse_confidence("1.5"), Err(ApiError::BadRequest(_))));
        assert!(matches!(parse_confidence("NaN"), Err(ApiError::BadRequest(_))));
    }
}
