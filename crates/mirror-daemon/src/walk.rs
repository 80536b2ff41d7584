//! Fast pruning directory walker.
//!
//! Yields `(path, is_dir)` pairs depth-first; the callback may clear the
//! descend flag on a directory to skip its subtree. Entry kinds come from
//! the dirent itself, so enumerating never stats the entries. Errors inside
//! subdirectories are logged and skipped; only the root's failure
//! propagates.

use std::io;
use std::path::Path;

use tracing::warn;

/// Walk `root` recursively, calling `cb(path, is_dir, descend)` for every
/// entry. `descend` starts true and only matters for directories.
pub fn walk_dirs<F>(root: &Path, cb: &mut F) -> io::Result<()>
where
    F: FnMut(&Path, bool, &mut bool),
{
    for entry in std::fs::read_dir(root)? {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                warn!(dir = %root.display(), error = %e, "failed to read directory entry");
                continue;
            }
        };
        let file_type = match entry.file_type() {
            Ok(t) => t,
            Err(e) => {
                warn!(path = %entry.path().display(), error = %e, "failed to read entry type");
                continue;
            }
        };

        let path = entry.path();
        let mut descend = true;
        if file_type.is_dir() {
            cb(&path, true, &mut descend);
            if descend {
                if let Err(e) = walk_dirs(&path, cb) {
                    warn!(dir = %path.display(), error = %e, "failed to read directory");
                }
            }
        } else {
            cb(&path, false, &mut descend);
        }
    }
    Ok(())
}
