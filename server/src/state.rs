//! Application state.

use std::sync::{Arc, Mutex, MutexGuard};

use anyhow::Result;
use peoplespot_core::detection::Detect;
use peoplespot_core::session::{OutputDir, Session};

use crate::config::ServerConfig;

/// Detector shared by every request.  Inference is serialized behind the lock.
pub type SharedDetector = Arc<Mutex<Box<dyn Detect + Send>>>;

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<ServerConfig>,
    pub session: Arc<Session>,
    pub detector: SharedDetector,
}

impl AppState {
    /// Build state around an already-loaded detector; creates the output
    /// directory if needed.
    pub fn new<D>(config: ServerConfig, detector: D) -> Result<Self>
    where
        D: Detect + Send + 'static,
    {
        let output_dir = OutputDir::new(&config.output_dir)?;
        let session = Session::new(output_dir, config.encode_mode());
        let detector: Box<dyn Detect + Send> = Box::new(detector);
        Ok(Self {
            config: Arc::new(config),
            session: Arc::new(session),
            detector: Arc::new(Mutex::new(detector)),
        })
    }
}

/// Lock the detector, recovering from a poisoned lock.
pub fn lock_detector(detector: &SharedDetector) -> MutexGuard<'_, Box<dyn Detect + Send>> {
    detector.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
