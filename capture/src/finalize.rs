//! Promote provisional `.part` files to their final names.

use std::ffi::OsString;
use std::path::{Path, PathBuf};

use tracing::{debug, info};

/// What [`finalize`] did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Finalized {
    Renamed(PathBuf),
    /// A file with the final name already existed and was replaced.
    Replaced(PathBuf),
    /// No provisional file was found; nothing to do.
    Missing,
}

/// `{base}.{suffix}`
pub fn final_path(base: &Path, suffix: &str) -> PathBuf {
    append(base, &format!(".{suffix}"))
}

/// `{base}.{suffix}.part`
pub fn provisional_path(base: &Path, suffix: &str) -> PathBuf {
    append(base, &format!(".{suffix}.part"))
}

/// Rename `{base}.{suffix}.part` to `{base}.{suffix}`.
///
/// A missing provisional file is not an error.  An existing final file is
/// overwritten (last writer wins); this happens when two attempts in the
/// same second derive the same name.
pub fn finalize(base: &Path, suffix: &str) -> std::io::Result<Finalized> {
    let part = provisional_path(base, suffix);
    let done = final_path(base, suffix);

    if !part.exists() {
        info!("No provisional file to finalize: {}", part.display());
        return Ok(Finalized::Missing);
    }

    let replacing = done.exists();
    match std::fs::rename(&part, &done) {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            info!("Provisional file vanished before rename: {}", part.display());
            return Ok(Finalized::Missing);
        }
        Err(e) => return Err(e),
    }

    if replacing {
        info!("Replaced existing {} with {}", done.display(), part.display());
        Ok(Finalized::Replaced(done))
    } else {
        debug!("Renamed {} → {}", part.display(), done.display());
        Ok(Finalized::Renamed(done))
    }
}

fn append(base: &Path, tail: &str) -> PathBuf {
    let mut s = OsString::from(base.as_os_str());
    s.push(tail);
    PathBuf::from(s)
}
