use std::collections::HashSet;
use std::path::Path;

use log::{info, warn};
use walkdir::WalkDir;

/// Remove leftover staging directories under `temp_dir` that do not belong
/// to a live upload session. Run at startup, before uploads begin, so the
/// live set is normally empty. Returns the number of entries removed.
pub fn sweep_staging(temp_dir: &Path, live: &HashSet<String>) -> usize {
    if !temp_dir.exists() {
        return 0;
    }

    let mut removed = 0;
    for entry in WalkDir::new(temp_dir)
        .min_depth(1)
        .max_depth(1)
        .into_iter()
        .filter_map(|e| e.ok())
    {
        let name = entry.file_name().to_string_lossy().into_owned();
        if live.contains(&name) {
            continue;
        }
        let result = if entry.file_type().is_dir() {
            std::fs::remove_dir_all(entry.path())
        } else {
            std::fs::remove_file(entry.path())
        };
        match result {
            Ok(()) => removed += 1,
            Err(e) => warn!("sweep: removing {} failed: {}", entry.path().display(), e),
        }
    }

    if removed > 0 {
        info!("swept {} stale staging entr(ies) from {}", removed, temp_dir.display());
    }
    removed
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sweep_removes_stale_entries() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("stale-session")).unwrap();
        std::fs::write(dir.path().join("stale-session/chunk_0"), b"x").unwrap();
        std::fs::write(dir.path().join("orphan.part"), b"y").unwrap();

        let removed = sweep_staging(dir.path(), &HashSet::new());
        assert_eq!(removed, 2);
        assert!(!dir.path().join("stale-session").exists());
        assert!(!dir.path().join("orphan.part").exists());
    }

    #[test]
    fn test_sweep_keeps_live_sessions() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("live-session")).unwrap();
        std::fs::create_dir(dir.path().join("dead-session")).unwrap();

        let live: HashSet<String> = ["live-session".to_string()].into_iter().collect();
        let removed = sweep_staging(dir.path(), &live);
        assert_eq!(removed, 1);
        assert!(dir.path().join("live-session").exists());
        assert!(!dir.path().join("dead-session").exists());
    }

    #[test]
    fn test_sweep_missing_dir_is_noop() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("nope");
        assert_eq!(sweep_staging(&missing, &HashSet::new()), 0);
    }
}
