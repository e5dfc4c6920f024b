//! Remote shell snippets used by the transfer paths.
//!
//! Every interpolated value is shell-escaped. Writes always land in a
//! temporary sibling of the destination and are renamed into place only after
//! the SHA-256 digest has been checked, so a failed transfer never leaves a
//! partial file at the destination.

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use shell_escape::unix::escape;

/// Exit status the commit script uses for a digest mismatch.
pub const CHECKSUM_MISMATCH_EXIT: i32 = 3;

fn quote(value: &str) -> String {
    escape(value.into()).into_owned()
}

/// Directory portion of a remote POSIX path.
#[must_use]
pub fn parent_dir(path: &str) -> &str {
    match path.rfind('/') {
        Some(0) | None => "/",
        Some(index) => path.get(..index).unwrap_or("/"),
    }
}

/// Final component of a remote POSIX path.
#[must_use]
pub fn file_name(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}

/// Temporary sibling used while `destination` is being written.
#[must_use]
pub fn temp_path(destination: &str, request_id: &str) -> String {
    let tag = request_id.get(..8).unwrap_or(request_id);
    format!("{destination}.sluice-{tag}.part")
}

/// Creates the parent directory and truncates the temporary file.
#[must_use]
pub fn begin_upload(destination: &str, tmp: &str) -> String {
    format!(
        "mkdir -p {} && : > {}",
        quote(parent_dir(destination)),
        quote(tmp)
    )
}

/// Appends one base64-encoded chunk to the temporary file.
#[must_use]
pub fn append_chunk(tmp: &str, chunk: &[u8]) -> String {
    format!(
        "printf '%s' {} | base64 -d >> {}",
        quote(&STANDARD.encode(chunk)),
        quote(tmp)
    )
}

/// Verifies the temporary file against `sha256_hex`, then renames it into
/// place. On mismatch the temporary file is removed and the script exits
/// with [`CHECKSUM_MISMATCH_EXIT`].
#[must_use]
pub fn commit_upload(tmp: &str, destination: &str, sha256_hex: &str) -> String {
    format!(
        "printf '%s  %s\\n' {sha} {part} | sha256sum -c --status || {{ rm -f {part} ; \
         echo 'checksum mismatch' >&2 ; exit {CHECKSUM_MISMATCH_EXIT} ; }} ; mv -f {part} {dest}",
        sha = quote(sha256_hex),
        part = quote(tmp),
        dest = quote(destination),
    )
}

/// Prints the size of a remote file in bytes.
#[must_use]
pub fn file_size(path: &str) -> String {
    format!("stat -c %s {}", quote(path))
}

/// Prints the hex SHA-256 digest of a remote file.
#[must_use]
pub fn file_digest(path: &str) -> String {
    format!("sha256sum {} | cut -d ' ' -f 1", quote(path))
}

/// Prints block `index` of a remote file, base64 encoded on one line.
#[must_use]
pub fn read_chunk(path: &str, block_size: usize, index: u64) -> String {
    format!(
        "dd {} bs={block_size} skip={index} count=1 2>/dev/null | base64 | tr -d '\\n'",
        quote(&format!("if={path}"))
    )
}

/// Has the target copy a staged object into `tmp`.
#[must_use]
pub fn pull_object(aws_bin: &str, url: &str, region: &str, destination: &str, tmp: &str) -> String {
    format!(
        "mkdir -p {} && {} s3 cp {} {} --region {} --only-show-errors",
        quote(parent_dir(destination)),
        quote(aws_bin),
        quote(url),
        quote(tmp),
        quote(region)
    )
}

/// Has the target copy `path` into a staged object.
#[must_use]
pub fn push_object(aws_bin: &str, path: &str, url: &str, region: &str) -> String {
    format!(
        "{} s3 cp {} {} --region {} --only-show-errors",
        quote(aws_bin),
        quote(path),
        quote(url),
        quote(region)
    )
}

/// Removes a leftover temporary file.
#[must_use]
pub fn remove_file(path: &str) -> String {
    format!("rm -f {}", quote(path))
}
