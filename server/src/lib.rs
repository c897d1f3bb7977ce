//! HTTP front-end: an upload form plus a small JSON API that runs the
//! detection pipeline on each uploaded video.

pub mod config;
pub mod error;
pub mod handlers;
pub mod routes;
pub mod state;
mod ui;

pub use config::ServerConfig;
pub use error::{ApiError, ApiResult};
pub use routes::create_router;
pub use state::AppState;
