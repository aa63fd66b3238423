//! Audit file management.
//!
//! Audit files are content-addressed by file number: `<n>_adt` inside the
//! audit directory.  The collector holds exactly one open append handle,
//! for the file named by the index table's current slot.

use std::fs::{File, OpenOptions, Permissions};
use std::io::Write;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use aur_core::Result;
use tracing::warn;

/// Owner read/write.  Owner-write is never dropped; the collector must be
/// able to keep appending to its own files.
const AUDIT_FILE_MODE: u32 = 0o600;

/// Path of the audit file with the given file number.
#[must_use]
pub fn audit_file_path(dir: &Path, filenum: u32) -> PathBuf {
    dir.join(format!("{filenum}_adt"))
}

/// The collector's open append handle to the current audit file.
#[derive(Debug)]
pub struct AuditFile {
    file: File,
    path: PathBuf,
    filenum: u32,
    offset: u64,
}

impl AuditFile {
    /// Open (or create) the audit file for `filenum` in append mode.
    ///
    /// Returns the handle and whether the file already existed; a fresh
    /// file gets owner-rw permissions and its slot's creation time is the
    /// caller's to set.
    pub fn open(dir: &Path, filenum: u32) -> Result<(Self, bool)> {
        let path = audit_file_path(dir, filenum);
        let existed = path.exists();
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        if !existed {
            std::fs::set_permissions(&path, Permissions::from_mode(AUDIT_FILE_MODE))?;
        }
        let offset = file.metadata()?.len();
        Ok((
            Self {
                file,
                path,
                filenum,
                offset,
            },
            existed,
        ))
    }

    /// Append one record's bytes.
    ///
    /// A full disk is waited out: there is nowhere to report the failure
    /// that does not itself need disk, so sleep a second and retry the same
    /// write until the operator makes room.  Any other error fails just
    /// this write.
    pub fn append(&mut self, buf: &[u8]) -> Result<()> {
        loop {
            match self.file.write_all(buf) {
                Ok(()) => break,
                Err(e) if e.raw_os_error() == Some(libc::ENOSPC) => {
                    std::thread::sleep(Duration::from_secs(1));
                }
                Err(e) => return Err(e.into()),
            }
        }
        self.offset += buf.len() as u64;
        Ok(())
    }

    /// Current size of the open file.
    #[must_use]
    pub fn offset(&self) -> u64 {
        self.offset
    }

    #[must_use]
    pub fn filenum(&self) -> u32 {
        self.filenum
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Final size for the index slot; dropping the handle closes the file.
    #[must_use]
    pub fn close(self) -> u64 {
        self.offset
    }
}

/// Unlink an audit file during eviction.  A file already gone is fine;
/// anything else is reported to the caller as a pass-stopping condition.
pub fn remove_audit_file(dir: &Path, filenum: u32) -> std::io::Result<()> {
    let path = audit_file_path(dir, filenum);
    match std::fs::remove_file(&path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => {
            warn!(
                target: "aurec::retention",
                file = %path.display(),
                error = %e,
                "could not remove audit file"
            );
            Err(e)
        }
    }
}
