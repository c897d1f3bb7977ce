//! session — output naming and the registry of files produced this run
//!
//! Every output video gets a fresh `preds_<uuid>.mp4` name inside the output
//! directory and is registered with `SessionFiles` before its first byte is
//! written.  `SessionFiles::clean` deletes whatever is still on disk; it also
//! runs on drop, so the registry's scope is the lifetime of those files.

use anyhow::{Context, Result, ensure};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::detection::Detect;
use crate::pipeline::{EncodeMode, RunSummary, annotate_video};

pub const OUTPUT_PREFIX: &str = "preds_";
pub const OUTPUT_EXTENSION: &str = "mp4";

/// `preds_<uuid v4>.mp4`
pub fn output_file_name() -> String {
    format!("{OUTPUT_PREFIX}{}.{OUTPUT_EXTENSION}", Uuid::new_v4())
}

/// Whether `name` is a bare file name of the shape [`output_file_name`] produces.
pub fn is_output_file_name(name: &str) -> bool {
    let Some(id) = name
        .strip_prefix(OUTPUT_PREFIX)
        .and_then(|rest| rest.strip_suffix(OUTPUT_EXTENSION))
        .and_then(|rest| rest.strip_suffix('.'))
    else {
        return false;
    };
    Uuid::parse_str(id).is_ok()
}

/// Process-lifetime list of produced files, deleted by [`clean`](Self::clean).
#[derive(Debug, Default)]
pub struct SessionFiles {
    paths: Mutex<Vec<PathBuf>>,
}

impl SessionFiles {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Vec<PathBuf>> {
        // A panic while holding the lock cannot leave the Vec half-updated.
        self.paths.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Record `path` for deletion.  Registering the same path twice is a no-op.
    pub fn register<P: Into<PathBuf>>(&self, path: P) {
        let path = path.into();
        let mut paths = self.lock();
        if !paths.contains(&path) {
            debug!(path = %path.display(), "registered output file");
            paths.push(path);
        }
    }

    pub fn contains(&self, path: &Path) -> bool {
        self.lock().iter().any(|p| p == path)
    }

    /// Registered path whose file name is `name`, if any.
    pub fn find_by_name(&self, name: &str) -> Option<PathBuf> {
        self.lock()
            .iter()
            .find(|p| p.file_name().is_some_and(|n| n == name))
            .cloned()
    }

    pub fn paths(&self) -> Vec<PathBuf> {
        self.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Delete every registered file that still exists.  Missing files are
    /// skipped; other failures are logged and do not stop the sweep.
    /// Returns how many files were removed.  Safe to call repeatedly.
    pub fn clean(&self) -> usize {
        let paths = self.lock();
        let mut removed = 0;
        for path in paths.iter() {
            match std::fs::remove_file(path) {
                Ok(()) => {
                    debug!(path = %path.display(), "removed output file");
                    removed += 1;
                }
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => warn!(path = %path.display(), error = %e, "failed to remove output file"),
            }
        }
        if removed > 0 {
            info!(removed, registered = paths.len(), "cleaned session output files");
        }
        removed
    }
}

impl Drop for SessionFiles {
    fn drop(&mut self) {
        self.clean();
    }
}

/// Directory new output videos are written into.
#[derive(Debug, Clone)]
pub struct OutputDir {
    dir: PathBuf,
}

impl OutputDir {
    /// Create `dir` if needed.
    pub fn new<P: Into<PathBuf>>(dir: P) -> Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("failed to create output directory {}", dir.display()))?;
        Ok(Self { dir })
    }

    pub fn path(&self) -> &Path {
        &self.dir
    }

    /// A fresh, unique output path.
    pub fn next_path(&self) -> PathBuf {
        self.dir.join(output_file_name())
    }
}

/// One produced video, as handed back to the interface layer.
#[derive(Debug, Clone)]
pub struct Prediction {
    pub path: PathBuf,
    pub summary: RunSummary,
}

impl Prediction {
    pub fn file_name(&self) -> String {
        self.path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default()
    }
}

/// Output directory + file registry + encode mode: everything a request
/// needs besides the detector and its inputs.
#[derive(Debug)]
pub struct Session {
    output_dir: OutputDir,
    files: SessionFiles,
    mode: EncodeMode,
}

impl Session {
    pub fn new(output_dir: OutputDir, mode: EncodeMode) -> Self {
        Self {
            output_dir,
            files: SessionFiles::new(),
            mode,
        }
    }

    pub fn files(&self) -> &SessionFiles {
        &self.files
    }

    pub fn output_dir(&self) -> &OutputDir {
        &self.output_dir
    }

    pub fn mode(&self) -> EncodeMode {
        self.mode
    }

    /// Run the pipeline on `input` and return the produced file.
    ///
    /// `Ok(None)` means the input decoded to zero frames: nothing was written
    /// and nothing was registered.
    pub fn predict<D, P>(
        &self,
        input: P,
        detector: &mut D,
        threshold: f32,
        progress: &mut dyn FnMut(u64, u64),
    ) -> Result<Option<Prediction>>
    where
        D: Detect + ?Sized,
        P: AsRef<Path>,
    {
        let output = self.output_dir.next_path();
        ensure!(!output.exists(), "output path {} already exists", output.display());

        let files = &self.files;
        let summary = annotate_video(
            input,
            &output,
            detector,
            threshold,
            self.mode,
            &mut |path: &Path| files.register(path),
            progress,
        )?;

        Ok(summary.map(|summary| Prediction {
            path: output,
            summary,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detection::Detection;
    use crate::video::Frame;

    #[test]
    fn output_names_are_unique_and_recognised() {
        let a = output_file_name();
        let b = output_file_name();
        assert_ne!(a, b);
        assert!(a.starts_with("preds_") && a.ends_with(".mp4"));
        assert!(is_output_file_name(&a));
        assert!(!is_output_file_name("preds_nope.mp4"));
        assert!(!is_output_file_name("../etc/passwd"));
        assert!(!is_output_file_name(&a.replace(".mp4", ".mkv")));
        assert!(!is_output_file_name(&a.replace(".mp4", "mp4")));
    }

    #[test]
    fn register_then_clean_deletes_the_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(output_file_name());
        std::fs::write(&path, b"video").unwrap();

        let files = SessionFiles::new();
        files.register(&path);
        assert!(files.contains(&path));
        assert_eq!(files.clean(), 1);
        assert!(!path.exists());
    }

    #[test]
    fn clean_is_idempotent_and_skips_missing_files() {
        let dir = tempfile::tempdir().unwrap();
        let present = dir.path().join("present.mp4");
        let missing = dir.path().join("missing.mp4");
        std::fs::write(&present, b"x").unwrap();

        let files = SessionFiles::new();
        files.register(&missing);
        files.register(&present);
        assert_eq!(files.clean(), 1);
        assert_eq!(files.clean(), 0);
        assert_eq!(files.len(), 2);
    }

    #[test]
    fn registering_twice_keeps_one_entry() {
        let files = SessionFiles::new();
        files.register("/tmp/a.mp4");
        files.register(PathBuf::from("/tmp/a.mp4"));
        assert_eq!(files.paths(), vec![PathBuf::from("/tmp/a.mp4")]);
        assert_eq!(files.find_by_name("a.mp4"), Some(PathBuf::from("/tmp/a.mp4")));
        assert_eq!(files.find_by_name("b.mp4"), None);
    }

    #[test]
    fn drop_cleans_registered_files() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dropped.mp4");
        std::fs::write(&path, b"x").unwrap();
        {
            let files = SessionFiles::new();
            files.register(&path);
        }
        assert!(!path.exists());
    }

    #[test]
    fn output_dir_paths_live_inside_the_directory() {
        let dir = tempfile::tempdir().unwrap();
        let out = OutputDir::new(dir.path().join("nested")).unwrap();
        assert!(out.path().is_dir());
        let next = out.next_path();
        assert_eq!(next.parent(), Some(out.path()));
        assert!(is_output_file_name(next.file_name().unwrap().to_str().unwrap()));
    }

    #[test]
    fn unreadable_input_is_an_error_and_registers_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("not-a-video.mp4");
        std::fs::write(&input, b"definitely not a video").unwrap();

        let session = Session::new(OutputDir::new(dir.path()).unwrap(), EncodeMode::Buffered);
        let mut detector =
            |_: &Frame, _: f32| -> Result<Vec<Detection>> { Ok(Vec::new()) };
        let result = session.predict(&input, &mut detector, 0.45, &mut |_, _| {});
        assert!(result.is_err());
        assert!(session.files().is_empty());
    }
}
