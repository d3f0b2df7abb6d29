//! Blocking filesystem routines used by restore and export. Callers run
//! them on the blocking thread pool.

use crate::ignore::IgnoreRules;
use crate::store::ContentStore;
use crate::{Error, FileRecord, Result};
use std::fs::{self, File};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, error, warn};
use walkdir::WalkDir;

pub fn remove_dir_if_exists(path: &Path) -> io::Result<()> {
    match fs::remove_dir_all(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}

/// Recursively copies `src` into `dst`, skipping entries the rules ignore.
pub fn copy_dir_filtered(src: &Path, dst: &Path, rules: &IgnoreRules) -> Result<()> {
    fs::create_dir_all(dst)?;
    let walker = WalkDir::new(src)
        .min_depth(1)
        .follow_links(false)
        .into_iter()
        .filter_entry(|entry| !rules.is_ignored(entry));
    for entry in walker {
        let entry = entry.map_err(|e| Error::Io(e.into()))?;
        let relative = entry
            .path()
            .strip_prefix(src)
            .map_err(|e| Error::Other(e.to_string()))?;
        let target = dst.join(relative);
        let file_type = entry.file_type();
        if file_type.is_dir() {
            fs::create_dir_all(&target)?;
        } else if file_type.is_file() {
            fs::copy(entry.path(), &target)?;
        } else if file_type.is_symlink() {
            copy_symlink(entry.path(), &target)?;
        }
    }
    Ok(())
}

#[cfg(unix)]
fn copy_symlink(src: &Path, dst: &Path) -> io::Result<()> {
    let link = fs::read_link(src)?;
    std::os::unix::fs::symlink(link, dst)
}

#[cfg(not(unix))]
fn copy_symlink(src: &Path, dst: &Path) -> io::Result<()> {
    fs::copy(src, dst).map(|_| ())
}

/// Moves a directory, falling back to copy-then-delete across filesystems.
///
/// If the copy succeeds but deleting `src` fails partway, the missing
/// entries are copied back into `src` and the copy at `dst` is dropped, so the
/// error leaves `src` complete. When `src` cannot be completed again the error
/// is [`Error::RollbackFailed`] and `dst` holds the only full copy.
pub fn move_dir(src: &Path, dst: &Path) -> Result<()> {
    move_dir_with(src, dst, |path| fs::remove_dir_all(path))
}

fn move_dir_with<F>(src: &Path, dst: &Path, remove_src: F) -> Result<()>
where
    F: FnOnce(&Path) -> io::Result<()>,
{
    if let Some(parent) = dst.parent() {
        fs::create_dir_all(parent)?;
    }
    match fs::rename(src, dst) {
        Ok(()) => return Ok(()),
        Err(e) => debug!(
            src = %src.display(),
            error = %e,
            "Rename failed, falling back to copy"
        ),
    }
    if let Err(e) = copy_dir_filtered(src, dst, &IgnoreRules::none()) {
        let _ = remove_dir_if_exists(dst);
        return Err(e);
    }
    let Err(removal) = remove_src(src) else {
        return Ok(());
    };

    warn!(
        src = %src.display(),
        error = %removal,
        "Source only partly deleted after copy, refilling it"
    );
    match refill_missing(dst, src) {
        Ok(()) => {
            if let Err(e) = remove_dir_if_exists(dst) {
                warn!(path = %dst.display(), error = %e, "Failed to drop copy after refill");
            }
            Err(Error::Io(removal))
        }
        Err(refill) => {
            error!(
                src = %src.display(),
                copy = %dst.display(),
                error = %refill,
                "Could not refill source; the copy is the only complete one"
            );
            Err(Error::RollbackFailed {
                holding_area: dst.to_path_buf(),
                cause: Box::new(Error::Io(removal)),
                rollback: Box::new(refill),
            })
        }
    }
}

/// Copies every entry of `from` that is absent in `to`. Entries already
/// present are left as they are.
fn refill_missing(from: &Path, to: &Path) -> Result<()> {
    fs::create_dir_all(to)?;
    for entry in WalkDir::new(from).min_depth(1).follow_links(false) {
        let entry = entry.map_err(|e| Error::Io(e.into()))?;
        let relative = entry
            .path()
            .strip_prefix(from)
            .map_err(|e| Error::Other(e.to_string()))?;
        let target = to.join(relative);
        if fs::symlink_metadata(&target).is_ok() {
            continue;
        }
        let file_type = entry.file_type();
        if file_type.is_dir() {
            fs::create_dir_all(&target)?;
        } else if file_type.is_file() {
            fs::copy(entry.path(), &target)?;
        } else if file_type.is_symlink() {
            copy_symlink(entry.path(), &target)?;
        }
    }
    Ok(())
}

/// Moves every existing source directory into the holding area and leaves
/// an empty directory in its place.
///
/// Either all existing directories end up in the holding area or, on
/// failure, every directory already moved is put back before the error is
/// returned. Returns the names that were moved. If a directory cannot be put
/// back the holding area is kept and the error is [`Error::RollbackFailed`].
pub fn relocate_to_holding(
    server_path: &Path,
    source_dirs: &[String],
    holding: &Path,
) -> Result<Vec<String>> {
    relocate_with(server_path, source_dirs, holding, move_dir)
}

fn relocate_with<F>(
    server_path: &Path,
    source_dirs: &[String],
    holding: &Path,
    mut mover: F,
) -> Result<Vec<String>>
where
    F: FnMut(&Path, &Path) -> Result<()>,
{
    fs::create_dir_all(holding)?;
    let mut moved: Vec<String> = Vec::new();

    for name in source_dirs {
        let live = server_path.join(name);
        if !live.exists() {
            continue;
        }
        let e = match mover(&live, &holding.join(name)) {
            Ok(()) => {
                moved.push(name.clone());
                continue;
            }
            Err(e) => e,
        };
        error!(dir = %name, error = %e, "Failed to move directory into holding area");

        let mut undo_failure = None;
        for done in moved.iter().rev() {
            if let Err(undo) = mover(&holding.join(done), &server_path.join(done)) {
                error!(dir = %done, error = %undo, "Failed to undo relocation");
                undo_failure = Some(undo);
                break;
            }
        }

        return match (e, undo_failure) {
            (Error::RollbackFailed { cause, rollback, .. }, _) => Err(Error::RollbackFailed {
                holding_area: holding.to_path_buf(),
                cause,
                rollback,
            }),
            (e, Some(undo)) => Err(Error::RollbackFailed {
                holding_area: holding.to_path_buf(),
                cause: Box::new(e),
                rollback: Box::new(undo),
            }),
            (e, None) => {
                let _ = remove_dir_if_exists(holding);
                Err(e)
            }
        };
    }

    for name in source_dirs {
        fs::create_dir_all(server_path.join(name))?;
    }
    Ok(moved)
}

/// Puts the held-aside directories back after a failed restore.
///
/// Every source directory is cleared first, so partially restored content
/// never survives; directories that did not exist before the restore stay
/// absent.
pub fn rollback_from_holding(
    server_path: &Path,
    source_dirs: &[String],
    moved: &[String],
    holding: &Path,
    rules: &IgnoreRules,
) -> Result<()> {
    for name in source_dirs {
        let live = server_path.join(name);
        remove_dir_if_exists(&live)?;
        if moved.contains(name) {
            let held = holding.join(name);
            if !held.is_dir() {
                return Err(Error::Io(io::Error::new(
                    io::ErrorKind::NotFound,
                    format!("held directory missing: {}", held.display()),
                )));
            }
            copy_dir_filtered(&held, &live, rules)?;
        }
    }
    Ok(())
}

/// Writes every directory and file of a backup below `dest_root`. Stops at
/// the first failure.
pub fn materialize(
    store: &ContentStore,
    dirs: &[String],
    files: &[FileRecord],
    dest_root: &Path,
) -> Result<u64> {
    for dir in dirs {
        let mut target = dest_root.to_path_buf();
        target.extend(dir.split('/').filter(|p| !p.is_empty()));
        fs::create_dir_all(&target)?;
    }
    let mut written = 0u64;
    for record in files {
        let target: PathBuf = dest_root.join(record.relative_path());
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut reader = store.open(&record.digest)?;
        let mut out = BufWriter::new(File::create(&target)?);
        written += io::copy(&mut reader, &mut out)?;
        out.flush()?;
    }
    debug!(files = files.len(), bytes = written, dest = %dest_root.display(), "Materialized files");
    Ok(written)
}

/// Deletes the holding area, logging instead of failing.
pub fn discard_holding(holding: &Path) {
    if let Err(e) = remove_dir_if_exists(holding) {
        warn!(path = %holding.display(), error = %e, "Failed to discard holding area");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn write(path: &Path, data: &str) {
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, data).unwrap();
    }

    #[test]
    fn test_copy_dir_filtered_skips_ignored() {
        let dir = TempDir::new().unwrap();
        let src = dir.path().join("src");
        write(&src.join("keep.txt"), "keep");
        write(&src.join("session.lock"), "lock");
        write(&src.join("nested/deep.txt"), "deep");

        let dst = dir.path().join("dst");
        copy_dir_filtered(&src, &dst, &IgnoreRules::default()).unwrap();
        assert_eq!(fs::read_to_string(dst.join("keep.txt")).unwrap(), "keep");
        assert_eq!(fs::read_to_string(dst.join("nested/deep.txt")).unwrap(), "deep");
        assert!(!dst.join("session.lock").exists());
    }

    #[test]
    fn test_relocate_and_rollback() {
        let dir = TempDir::new().unwrap();
        let server = dir.path().join("server");
        let holding = dir.path().join("overwrite");
        write(&server.join("world/level.dat"), "original");
        let dirs = vec!["world".to_string(), "world_nether".to_string()];

        let moved = relocate_to_holding(&server, &dirs, &holding).unwrap();
        assert_eq!(moved, vec!["world".to_string()]);
        assert!(holding.join("world/level.dat").exists());
        assert_eq!(fs::read_dir(server.join("world")).unwrap().count(), 0);
        assert!(server.join("world_nether").is_dir());

        write(&server.join("world/level.dat"), "partial");
        write(&server.join("world_nether/junk"), "junk");
        rollback_from_holding(&server, &dirs, &moved, &holding, &IgnoreRules::none()).unwrap();

        assert_eq!(
            fs::read_to_string(server.join("world/level.dat")).unwrap(),
            "original"
        );
        assert!(!server.join("world_nether").exists());
    }

    fn partial_delete(path: &Path) -> io::Result<()> {
        fs::remove_file(path.join("a.txt"))?;
        fs::remove_file(path.join("sub/b.txt"))?;
        Err(io::Error::new(io::ErrorKind::PermissionDenied, "pinned"))
    }

    fn three_files(root: &Path) {
        write(&root.join("a.txt"), "a");
        write(&root.join("sub/b.txt"), "b");
        write(&root.join("sub/c.txt"), "c");
    }

    #[test]
    fn test_move_dir_refills_source_after_partial_delete() {
        let dir = TempDir::new().unwrap();
        let src = dir.path().join("world");
        let dst = dir.path().join("overwrite/world");
        three_files(&src);
        // A non-empty destination makes the rename fail and forces the copy.
        write(&dst.join("stale"), "stale");

        let err = move_dir_with(&src, &dst, partial_delete).unwrap_err();
        assert!(matches!(err, Error::Io(_)));
        assert_eq!(fs::read_to_string(src.join("a.txt")).unwrap(), "a");
        assert_eq!(fs::read_to_string(src.join("sub/b.txt")).unwrap(), "b");
        assert_eq!(fs::read_to_string(src.join("sub/c.txt")).unwrap(), "c");
        assert!(!dst.exists());
    }

    #[test]
    fn test_move_dir_keeps_copy_when_source_cannot_be_refilled() {
        let dir = TempDir::new().unwrap();
        let src = dir.path().join("world");
        let dst = dir.path().join("overwrite/world");
        three_files(&src);
        write(&dst.join("stale"), "stale");

        let err = move_dir_with(&src, &dst, |path| {
            fs::remove_dir_all(path)?;
            fs::write(path, "not a directory")?;
            Err(io::Error::new(io::ErrorKind::PermissionDenied, "pinned"))
        })
        .unwrap_err();

        match err {
            Error::RollbackFailed { holding_area, .. } => assert_eq!(holding_area, dst),
            other => panic!("expected RollbackFailed, got {:?}", other),
        }
        assert_eq!(fs::read_to_string(dst.join("sub/c.txt")).unwrap(), "c");
        assert_eq!(fs::read_to_string(dst.join("a.txt")).unwrap(), "a");
    }

    #[test]
    fn test_relocate_puts_earlier_dirs_back_when_a_later_one_fails() {
        let dir = TempDir::new().unwrap();
        let server = dir.path().join("server");
        let holding = dir.path().join("overwrite");
        write(&server.join("world/level.dat"), "overworld");
        write(&server.join("world_nether/DIM-1/r.0.0.mca"), "nether");
        write(&server.join("world_the_end/DIM1/r.0.0.mca"), "end");
        let dirs = vec![
            "world".to_string(),
            "world_nether".to_string(),
            "world_the_end".to_string(),
        ];

        let err = relocate_with(&server, &dirs, &holding, |src, dst| {
            if src.ends_with("world_nether") {
                return Err(Error::Io(io::Error::new(io::ErrorKind::PermissionDenied, "busy")));
            }
            move_dir(src, dst)
        })
        .unwrap_err();

        assert!(matches!(err, Error::Io(_)));
        assert_eq!(
            fs::read_to_string(server.join("world/level.dat")).unwrap(),
            "overworld"
        );
        assert_eq!(
            fs::read_to_string(server.join("world_nether/DIM-1/r.0.0.mca")).unwrap(),
            "nether"
        );
        assert!(server.join("world_the_end/DIM1/r.0.0.mca").exists());
        assert!(!holding.exists());
    }

    #[test]
    fn test_relocate_keeps_holding_when_a_source_is_lost() {
        let dir = TempDir::new().unwrap();
        let server = dir.path().join("server");
        let holding = dir.path().join("overwrite");
        write(&server.join("world/level.dat"), "overworld");
        three_files(&server.join("world_nether"));
        write(&holding.join("world_nether/stale"), "stale");
        let dirs = vec!["world".to_string(), "world_nether".to_string()];

        let err = relocate_with(&server, &dirs, &holding, |src, dst| {
            if src.ends_with("world_nether") {
                return move_dir_with(src, dst, |path| {
                    fs::remove_dir_all(path)?;
                    fs::write(path, "not a directory")?;
                    Err(io::Error::new(io::ErrorKind::PermissionDenied, "pinned"))
                });
            }
            move_dir(src, dst)
        })
        .unwrap_err();

        match err {
            Error::RollbackFailed { holding_area, .. } => assert_eq!(holding_area, holding),
            other => panic!("expected RollbackFailed, got {:?}", other),
        }
        assert_eq!(
            fs::read_to_string(holding.join("world_nether/sub/b.txt")).unwrap(),
            "b"
        );
        assert_eq!(
            fs::read_to_string(server.join("world/level.dat")).unwrap(),
            "overworld"
        );
    }

    #[test]
    fn test_materialize_recreates_empty_dirs() {
        let dir = TempDir::new().unwrap();
        let store = ContentStore::new(dir.path().join("data"), 0).unwrap();
        store.init().unwrap();
        let dest = dir.path().join("out");
        let dirs = vec!["world".to_string(), "world/datapacks".to_string()];

        assert_eq!(materialize(&store, &dirs, &[], &dest).unwrap(), 0);
        assert!(dest.join("world/datapacks").is_dir());
    }

    #[test]
    fn test_rollback_fails_when_holding_is_gone() {
        let dir = TempDir::new().unwrap();
        let server = dir.path().join("server");
        let holding = dir.path().join("overwrite");
        write(&server.join("world/a"), "a");
        let dirs = vec!["world".to_string()];

        let moved = relocate_to_holding(&server, &dirs, &holding).unwrap();
        fs::remove_dir_all(holding.join("world")).unwrap();
        assert!(rollback_from_holding(&server, &dirs, &moved, &holding, &IgnoreRules::none()).is_err());
    }
}
