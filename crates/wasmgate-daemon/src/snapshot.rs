use std::io;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

const RESTORE_MARKER: &str = "restore_pending.json";

#[derive(Debug, Serialize, Deserialize)]
struct RestoreMarker {
    file: PathBuf,
}

fn copy_dir(src: &Path, dest: &Path) -> io::Result<()> {
    std::fs::create_dir_all(dest)?;
    for entry in std::fs::read_dir(src)? {
        let entry = entry?;
        let target = dest.join(entry.file_name());
        if entry.file_type()?.is_dir() {
            copy_dir(&entry.path(), &target)?;
        } else {
            std::fs::copy(entry.path(), &target)?;
        }
    }
    Ok(())
}

/// Copies the broker data directory into a timestamped sibling snapshot
/// directory and returns its path.
pub fn create_snapshot(data_dir: &Path) -> io::Result<PathBuf> {
    let parent = data_dir.parent().unwrap_or_else(|| Path::new("."));
    let name = format!("broker_{}", chrono::Utc::now().format("%Y%m%d-%H%M%S"));
    let dest = parent.join("snapshots").join(name);
    copy_dir(data_dir, &dest)?;
    tracing::info!(file = %dest.display(), "broker snapshot created");
    Ok(dest)
}

/// Records a pending restore. The marker is applied on the next startup,
/// before the broker opens its journals.
pub fn schedule_restore(data_dir: &Path, snapshot: &Path) -> io::Result<()> {
    if !snapshot.is_dir() {
        return Err(io::Error::new(
            io::ErrorKind::NotFound,
            format!("snapshot {} does not exist", snapshot.display()),
        ));
    }
    std::fs::create_dir_all(data_dir)?;
    let marker = RestoreMarker {
        file: snapshot.to_path_buf(),
    };
    let body = serde_json::to_vec_pretty(&marker)?;
    std::fs::write(data_dir.join(RESTORE_MARKER), body)?;
    Ok(())
}

/// Replaces the data directory with the marked snapshot, if one is
/// pending. Returns the snapshot path that was applied.
pub fn apply_pending_restore(data_dir: &Path) -> io::Result<Option<PathBuf>> {
    let marker_path = data_dir.join(RESTORE_MARKER);
    if !marker_path.exists() {
        return Ok(None);
    }
    let marker: RestoreMarker = serde_json::from_slice(&std::fs::read(&marker_path)?)?;
    if !marker.file.is_dir() {
        tracing::warn!(file = %marker.file.display(), "pending restore points at a missing snapshot; ignoring");
        std::fs::remove_file(&marker_path)?;
        return Ok(None);
    }
    std::fs::remove_dir_all(data_dir)?;
    copy_dir(&marker.file, data_dir)?;
    tracing::info!(file = %marker.file.display(), "broker data restored from snapshot");
    Ok(Some(marker.file))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_copies_the_tree() {
        let root = tempfile::tempdir().unwrap();
        let data = root.path().join("data");
        std::fs::create_dir_all(data.join("streams/WORKER_A")).unwrap();
        std::fs::write(data.join("streams/WORKER_A/journal.log"), b"records").unwrap();

        let snap = create_snapshot(&data).unwrap();
        assert!(snap.starts_with(root.path().join("snapshots")));
        assert_eq!(
            std::fs::read(snap.join("streams/WORKER_A/journal.log")).unwrap(),
            b"records"
        );
    }

    #[test]
    fn restore_round_trip() {
        let root = tempfile::tempdir().unwrap();
        let data = root.path().join("data");
        std::fs::create_dir_all(&data).unwrap();
        std::fs::write(data.join("state.bin"), b"v1").unwrap();

        let snap = create_snapshot(&data).unwrap();
        std::fs::write(data.join("state.bin"), b"v2-corrupted").unwrap();

        schedule_restore(&data, &snap).unwrap();
        let applied = apply_pending_restore(&data).unwrap();
        assert_eq!(applied, Some(snap));
        assert_eq!(std::fs::read(data.join("state.bin")).unwrap(), b"v1");
        // Marker is gone with the wipe.
        assert!(apply_pending_restore(&data).unwrap().is_none());
    }

    #[test]
    fn restore_requires_an_existing_snapshot() {
        let root = tempfile::tempdir().unwrap();
        let data = root.path().join("data");
        std::fs::create_dir_all(&data).unwrap();
        let err = schedule_restore(&data, &root.path().join("missing")).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotFound);
    }
}
