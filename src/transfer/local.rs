//! Local file access for transfers.
//!
//! Files are reached through a capability handle on their parent directory.
//! Downloads are written to a temporary sibling and renamed into place once
//! verified.

use std::io::{self, Read, Write};

use camino::{Utf8Path, Utf8PathBuf};
use cap_std::{ambient_authority, fs_utf8::Dir};
use sha2::{Digest, Sha256};

const READ_BUFFER_BYTES: usize = 64 * 1024;

fn split(path: &Utf8Path) -> io::Result<(Dir, &str)> {
    let name = path.file_name().ok_or_else(|| {
        io::Error::new(io::ErrorKind::InvalidInput, "path does not name a file")
    })?;
    let parent = match path.parent() {
        Some(dir) if !dir.as_str().is_empty() => dir,
        _ => Utf8Path::new("."),
    };
    Ok((Dir::open_ambient_dir(parent, ambient_authority())?, name))
}

/// Size of a local file in bytes.
///
/// # Errors
///
/// Returns the I/O error when the file cannot be inspected.
pub fn file_size(path: &Utf8Path) -> io::Result<u64> {
    let (dir, name) = split(path)?;
    Ok(dir.metadata(name)?.len())
}

pub(super) fn read_all(path: &Utf8Path) -> io::Result<Vec<u8>> {
    let (dir, name) = split(path)?;
    dir.read(name)
}

pub(super) fn digest_file(path: &Utf8Path) -> io::Result<String> {
    let (dir, name) = split(path)?;
    let mut file = dir.open(name)?;
    let mut hasher = Sha256::new();
    let mut buffer = vec![0_u8; READ_BUFFER_BYTES];
    loop {
        let read = file.read(&mut buffer)?;
        let Some(filled) = buffer.get(..read).filter(|bytes| !bytes.is_empty()) else {
            break;
        };
        hasher.update(filled);
    }
    Ok(hex::encode(hasher.finalize()))
}

pub(super) fn digest_bytes(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

/// Temporary sibling a download is written to before it is verified.
pub(super) fn temp_sibling(path: &Utf8Path, request_id: &str) -> Utf8PathBuf {
    let tag = request_id.get(..8).unwrap_or(request_id);
    let name = path.file_name().unwrap_or("download");
    path.with_file_name(format!(".{name}.sluice-{tag}.part"))
}

pub(super) fn write_file(path: &Utf8Path, bytes: &[u8]) -> io::Result<()> {
    let (dir, name) = split(path)?;
    let mut file = dir.create(name)?;
    file.write_all(bytes)?;
    file.sync_all()
}

pub(super) fn rename(from: &Utf8Path, to: &Utf8Path) -> io::Result<()> {
    let (from_dir, from_name) = split(from)?;
    let (to_dir, to_name) = split(to)?;
    from_dir.rename(from_name, &to_dir, to_name)
}

/// Removes `path`, treating a missing file as already removed.
pub(super) fn discard(path: &Utf8Path) -> io::Result<()> {
    let (dir, name) = split(path)?;
    match dir.remove_file(name) {
        Err(err) if err.kind() != io::ErrorKind::NotFound => Err(err),
        _ => Ok(()),
    }
}
