//! HTTP handlers.

pub mod files;
pub mod health;
pub mod index;
pub mod predict;

pub use files::serve_file;
pub use health::health;
pub use index::index;
pub use predict::predict;
