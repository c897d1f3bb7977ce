use std::path::{Path, PathBuf};

/// File name of the ONNX Runtime shared library on this platform.
pub const ORT_LIBRARY: &str = if cfg!(target_os = "macos") {
    "libonnxruntime.dylib"
} else if cfg!(target_os = "windows") {
    "onnxruntime.dll"
} else {
    "libonnxruntime.so"
};

/// Resolve and set ORT_DYLIB_PATH at runtime when it is missing or invalid.
///
/// Priority order:
/// 1) Existing ORT_DYLIB_PATH (if file exists)
/// 2) models/onnxruntime*/lib/<lib> near the cwd or any ancestor of the exe
/// 3) system library directories
///
/// Returns the path in effect, if any.  Must run before the first ORT session
/// is created and before any other thread is spawned, since it may call
/// `std::env::set_var`.
pub fn configure_ort_dylib() -> Option<PathBuf> {
    if let Some(existing) = std::env::var_os("ORT_DYLIB_PATH") {
        let existing_path = PathBuf::from(existing);
        if existing_path.is_file() {
            tracing::info!(path = %existing_path.display(), "using ORT_DYLIB_PATH from environment");
            return Some(existing_path);
        }
        tracing::warn!(
            path = %existing_path.display(),
            "ORT_DYLIB_PATH is set but file does not exist; attempting auto-discovery"
        );
    }

    let found = ort_candidates(&search_roots())
        .into_iter()
        .find(|candidate| candidate.is_file());
    match found {
        Some(candidate) => {
            // SAFETY: callers run this once at start-up while the process is
            // still single-threaded (before the tokio runtime is built) and
            // before any ORT session exists.
            unsafe {
                std::env::set_var("ORT_DYLIB_PATH", &candidate);
            }
            tracing::info!(path = %candidate.display(), "configured ORT_DYLIB_PATH");
            Some(candidate)
        }
        None => {
            tracing::warn!(
                library = ORT_LIBRARY,
                "could not locate the ONNX Runtime library; set ORT_DYLIB_PATH"
            );
            None
        }
    }
}

fn search_roots() -> Vec<PathBuf> {
    let mut roots = Vec::new();

    if let Ok(cwd) = std::env::current_dir() {
        roots.push(cwd);
    }

    if let Ok(exe) = std::env::current_exe() {
        let mut dir = exe.parent().map(Path::to_path_buf);
        for _ in 0..7 {
            let Some(d) = dir else {
                break;
            };
            roots.push(d.clone());
            dir = d.parent().map(Path::to_path_buf);
        }
    }
    roots
}

fn ort_candidates(roots: &[PathBuf]) -> Vec<PathBuf> {
    let mut candidates = Vec::new();
    for root in roots {
        candidates.push(root.join("models/onnxruntime/lib").join(ORT_LIBRARY));
        candidates.push(root.join("models").join(ORT_LIBRARY));
    }

    for system_dir in ["/usr/local/lib", "/usr/lib", "/opt/homebrew/lib"] {
        candidates.push(Path::new(system_dir).join(ORT_LIBRARY));
    }
    candidates
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn model_dirs_are_searched_before_system_dirs() {
        let roots = vec![PathBuf::from("/srv/app")];
        let candidates = ort_candidates(&roots);
        assert_eq!(
            candidates[0],
            PathBuf::from("/srv/app/models/onnxruntime/lib").join(ORT_LIBRARY)
        );
        assert_eq!(candidates[1], PathBuf::from("/srv/app/models").join(ORT_LIBRARY));
        assert_eq!(
            candidates.last(),
            Some(&Path::new("/opt/homebrew/lib").join(ORT_LIBRARY))
        );
    }
}
