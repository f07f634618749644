//! File helpers shared by the state store and the audit log

use std::fs;
use std::path::{Path, PathBuf};

use rand::Rng;

use crate::error::{PersistError, PersistResult};

/// Write `content` to `target` through a sibling temp file and a rename, so
/// readers only ever see the old or the new content.
pub fn write_atomic(target: &Path, content: &[u8]) -> PersistResult<()> {
    let temp_path = temp_sibling(target);

    fs::write(&temp_path, content).map_err(|e| PersistError::io(&temp_path, e))?;

    if let Err(e) = fs::rename(&temp_path, target) {
        let _ = fs::remove_file(&temp_path);
        return Err(PersistError::io(target, e));
    }

    Ok(())
}

/// `.<name>.tmp_<millis>_<random>` next to `target`.
fn temp_sibling(target: &Path) -> PathBuf {
    let name = target
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "state".to_string());
    let suffix: u32 = rand::thread_rng().gen();
    let millis = chrono::Utc::now().timestamp_millis();
    target.with_file_name(format!(".{name}.tmp_{millis}_{suffix:08x}"))
}

/// Path of the `index`-th rotation of `path` (`file.json.2`).
pub fn rotated_path(path: &Path, index: usize) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(format!(".{index}"));
    PathBuf::from(name)
}

/// Shift `path.1 .. path.(keep-1)` up one slot and move `path` to `path.1`.
///
/// At most `keep` rotations survive; the oldest is dropped. A missing
/// `path` is a no-op.
pub fn rotate_file(path: &Path, keep: usize) -> PersistResult<()> {
    if !path.exists() {
        return Ok(());
    }
    let keep = keep.max(1);

    let oldest = rotated_path(path, keep);
    if oldest.exists() {
        fs::remove_file(&oldest).map_err(|e| PersistError::io(&oldest, e))?;
    }

    for index in (1..keep).rev() {
        let from = rotated_path(path, index);
        if from.exists() {
            let to = rotated_path(path, index + 1);
            fs::rename(&from, &to).map_err(|e| PersistError::io(&from, e))?;
        }
    }

    let first = rotated_path(path, 1);
    fs::rename(path, &first).map_err(|e| PersistError::io(path, e))?;
    Ok(())
}

/// Size of `path` in bytes, 0 when it does not exist.
pub fn file_len(path: &Path) -> u64 {
    fs::metadata(path).map(|m| m.len()).unwrap_or(0)
}

/// Replace every character outside `[a-zA-Z0-9._-]` with `_`.
pub fn safe_file_stem(name: &str) -> String {
    name.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                c
            } else {
                '_'
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_write_atomic_replaces_content_and_leaves_no_temp() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("state.json");

        write_atomic(&target, b"one").unwrap();
        write_atomic(&target, b"two").unwrap();

        assert_eq!(fs::read_to_string(&target).unwrap(), "two");
        let entries: Vec<_> = fs::read_dir(dir.path()).unwrap().collect();
        assert_eq!(entries.len(), 1);
    }

    #[test]
    fn test_rotate_keeps_bounded_history() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("log.jsonl");

        for generation in 0..5 {
            fs::write(&path, format!("gen{generation}")).unwrap();
            rotate_file(&path, 3).unwrap();
        }

        assert!(!path.exists());
        assert_eq!(fs::read_to_string(rotated_path(&path, 1)).unwrap(), "gen4");
        assert_eq!(fs::read_to_string(rotated_path(&path, 2)).unwrap(), "gen3");
        assert_eq!(fs::read_to_string(rotated_path(&path, 3)).unwrap(), "gen2");
        assert!(!rotated_path(&path, 4).exists());
    }

    #[test]
    fn test_rotate_missing_file_is_noop() {
        let dir = tempfile::tempdir().unwrap();
        rotate_file(&dir.path().join("absent"), 3).unwrap();
    }

    #[test]
    fn test_safe_file_stem() {
        assert_eq!(safe_file_stem("claude-4.5"), "claude-4.5");
        assert_eq!(safe_file_stem("vendor/model:v1"), "vendor_model_v1");
    }
}
