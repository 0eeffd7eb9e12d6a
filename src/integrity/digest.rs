//! Streaming content digests.

use std::fs::OpenOptions;
use std::io::{self, Read};
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::OpenOptionsExt;
use std::path::Path;

use sha2::{Digest, Sha256};

/// Default read chunk size.
pub const DEFAULT_CHUNK_SIZE: usize = 64 * 1024;

/// SHA-256 of everything `reader` yields, read `chunk_size` bytes at a time,
/// as lowercase hex.
///
/// # Errors
///
/// Returns the first read error other than `Interrupted`.
pub fn hash_reader<R: Read>(mut reader: R, chunk_size: usize) -> io::Result<String> {
    let mut hasher = Sha256::new();
    let mut buffer = vec![0u8; chunk_size.max(1)];
    loop {
        match reader.read(&mut buffer) {
            Ok(0) => break,
            Ok(n) => hasher.update(&buffer[..n]),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    Ok(hex::encode(hasher.finalize()))
}

/// SHA-256 of the regular file at `path`. Symlinks are not followed.
///
/// The open never blocks, so a FIFO swapped in under the same name is
/// rejected instead of stalling the caller.
///
/// # Errors
///
/// Returns the OS error if the file cannot be opened or read. A symlink
/// fails with `ELOOP`; anything other than a regular file fails with
/// [`io::ErrorKind::InvalidInput`].
pub fn hash_file(path: &Path, chunk_size: usize) -> io::Result<String> {
    let file = OpenOptions::new()
        .read(true)
        .custom_flags(nix::libc::O_NOFOLLOW | nix::libc::O_NONBLOCK)
        .open(path)?;
    if !file.metadata()?.file_type().is_file() {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            "not a regular file",
        ));
    }
    hash_reader(file, chunk_size)
}

/// Stable store key for `path`: SHA-256 hex of its raw bytes.
#[must_use]
pub fn path_key(path: &Path) -> String {
    hex::encode(Sha256::digest(path.as_os_str().as_bytes()))
}
