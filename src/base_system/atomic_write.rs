use std::io::{self, Write};
use std::path::Path;

/// Writes `bytes` to a temp file next to `path`, then renames it over `path`.
///
/// Readers see either the old content or the new content, never a torn
/// write. The temp file has no extension, so directory scans filtering on
/// extension skip leftovers from a crash.
pub fn write_atomic(path: &Path, bytes: &[u8]) -> io::Result<()> {
    let dir = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };
    let mut tmp = tempfile::Builder::new().prefix(".tmp-").tempfile_in(dir)?;
    tmp.write_all(bytes)?;
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|e| e.error)?;
    Ok(())
}
