//! In-memory tar archives for writing the daemon into a container.

use std::io;
use std::path::Path;

/// Name the daemon executable is given inside the container.
pub const DAEMON_BINARY_NAME: &str = "daytona";

/// Directory the daemon executable is written to inside the container.
pub const CONTAINER_BIN_DIR: &str = "/usr/local/bin";

/// Build a tar archive holding `source` renamed to `entry_name`, mode 0755.
pub fn executable_archive(source: &Path, entry_name: &str) -> io::Result<Vec<u8>> {
    let contents = std::fs::read(source)?;
    archive_bytes(entry_name, &contents)
}

fn archive_bytes(entry_name: &str, contents: &[u8]) -> io::Result<Vec<u8>> {
    let mut header = tar::Header::new_gnu();
    header.set_size(contents.len() as u64);
    header.set_mode(0o755);
    header.set_mtime(
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0),
    );
    header.set_cksum();

    let mut builder = tar::Builder::new(Vec::new());
    builder.append_data(&mut header, entry_name, contents)?;
    builder.into_inner()
}
