//! ---
//! gw_section: "02-messaging-ipc-data-model"
//! gw_subsection: "module"
//! gw_type: "source"
//! gw_scope: "code"
//! gw_description: "Named-pipe debug tap for locally produced readings."
//! gw_version: "v0.0.0-prealpha"
//! gw_owner: "tbd"
//! ---
use std::fs::OpenOptions;
use std::io::{ErrorKind, Write};
use std::os::unix::fs::{FileTypeExt, OpenOptionsExt};
use std::path::{Path, PathBuf};

use nix::sys::stat::Mode;
use nix::unistd::mkfifo;
use tracing::{debug, info};

use crate::Result;

/// Write end of a FIFO that a developer can `cat` to watch readings.
///
/// Each write opens the pipe non-blocking, so a missing reader never stalls
/// the distributor.
#[derive(Debug, Clone)]
pub struct GeekPipe {
    path: PathBuf,
}

impl GeekPipe {
    /// Create the FIFO at `path` unless something already exists there.
    pub fn create(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        match std::fs::metadata(&path) {
            Ok(meta) if meta.file_type().is_fifo() => {}
            Ok(_) => debug!(path = %path.display(), "geek pipe path exists and is not a fifo"),
            Err(err) if err.kind() == ErrorKind::NotFound => {
                mkfifo(&path, Mode::S_IRUSR | Mode::S_IWUSR | Mode::S_IRGRP | Mode::S_IROTH)?;
                info!(path = %path.display(), "geek pipe created");
            }
            Err(err) => return Err(err.into()),
        }
        Ok(Self { path })
    }

    /// FIFO location.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Write `payload` if a reader is attached. `ENXIO` (no reader) is an error.
    pub fn write(&self, payload: &str) -> Result<()> {
        let mut pipe = OpenOptions::new()
            .write(true)
            .custom_flags(nix::libc::O_NONBLOCK)
            .open(&self.path)?;
        pipe.write_all(payload.as_bytes())?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;

    #[test]
    fn write_without_reader_fails_fast() {
        let dir = tempfile::tempdir().unwrap();
        let pipe = GeekPipe::create(dir.path().join("geek")).unwrap();
        assert!(std::fs::metadata(pipe.path()).unwrap().file_type().is_fifo());
        assert!(pipe.write("time;1\n").is_err());
    }

    #[test]
    fn reader_sees_payload() {
        let dir = tempfile::tempdir().unwrap();
        let pipe = GeekPipe::create(dir.path().join("geek")).unwrap();
        // Opening the read end non-blocking succeeds without a writer.
        let mut reader = OpenOptions::new()
            .read(true)
            .custom_flags(nix::libc::O_NONBLOCK)
            .open(pipe.path())
            .unwrap();

        pipe.write("time;5;euid;1;device_id;2;pairs;0\n").unwrap();
        let mut received = String::new();
        reader.read_to_string(&mut received).unwrap();
        assert_eq!(received, "time;5;euid;1;device_id;2;pairs;0\n");
    }
}
