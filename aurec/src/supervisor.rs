//! Collector supervision.
//!
//! The supervisor owns the audit pipe across collector restarts: extant
//! producers keep writing into the same write end, so the read end must
//! survive a collector crash.  Respawn attempts are rate limited so a
//! collector dying at launch cannot busy-loop the host.

use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use aur_core::Result;
use tokio::net::unix::pipe;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::collector::Collector;
use crate::config::AuditSettings;
use crate::emitter::Emitter;

/// Minimum spacing between collector starts.
pub const RESTART_INTERVAL: Duration = Duration::from_secs(60);

pub struct Supervisor {
    settings: AuditSettings,
    config_path: Option<PathBuf>,
    read_end: Option<OwnedFd>,
    write_end: Option<Arc<OwnedFd>>,
    last_start: Option<Instant>,
}

impl Supervisor {
    #[must_use]
    pub fn new(settings: AuditSettings, config_path: Option<PathBuf>) -> Self {
        Self {
            settings,
            config_path,
            read_end: None,
            write_end: None,
            last_start: None,
        }
    }

    /// Spawn the collector task.
    ///
    /// The pipe is created on the first call and reused afterwards.
    /// Returns `Ok(None)` when auditing is disabled or a start happened
    /// within [`RESTART_INTERVAL`]; the caller is expected to try again
    /// later, exactly as a process supervisor would.
    pub fn start(&mut self) -> Result<Option<JoinHandle<Result<()>>>> {
        if !self.settings.enabled {
            return Ok(None);
        }
        if let Some(last) = self.last_start {
            if last.elapsed() < RESTART_INTERVAL {
                debug!(
                    target: "aurec::supervisor",
                    "too soon since last collector start, skipping"
                );
                return Ok(None);
            }
        }
        self.last_start = Some(Instant::now());

        let read_dup = match &self.read_end {
            Some(fd) => fd.try_clone()?,
            None => {
                let (read_end, write_end) = create_pipe()?;
                let dup = read_end.try_clone()?;
                self.read_end = Some(read_end);
                self.write_end = Some(Arc::new(write_end));
                dup
            }
        };

        std::fs::create_dir_all(&self.settings.audit_dir)?;

        let receiver = pipe::Receiver::from_owned_fd(read_dup)?;
        let collector = Collector::new(self.settings.clone(), self.config_path.clone(), receiver)?;

        info!(
            target: "aurec::supervisor",
            dir = %self.settings.audit_dir.display(),
            "starting audit collector"
        );
        Ok(Some(tokio::spawn(collector.run())))
    }

    /// Clear the respawn cooldown so the next `start` call proceeds.
    pub fn allow_immediate_restart(&mut self) {
        self.last_start = None;
    }

    /// Producer handle bound to this supervisor's pipe and policy.  Before
    /// the pipe is wired (`start` never called) the emitter routes records
    /// to the host log instead.
    #[must_use]
    pub fn emitter(&self) -> Emitter {
        Emitter::new(self.write_end.clone(), &self.settings)
    }

    /// Raw producer-side pipe end, for writers that frame records
    /// themselves (external processes get this fd across `fork`).
    #[must_use]
    pub fn writer_fd(&self) -> Option<Arc<OwnedFd>> {
        self.write_end.clone()
    }

    /// Drop the supervisor's write end.  Once every emitter clone is gone
    /// too, the collector sees EOF and shuts down.
    pub fn close_write_end(&mut self) {
        self.write_end = None;
    }
}

/// Plain `pipe(2)`.  Only the read end is switched to non-blocking; the
/// producer side keeps blocking semantics so a full pipe applies
/// backpressure instead of dropping records.
pub(crate) fn create_pipe() -> Result<(OwnedFd, OwnedFd)> {
    let mut fds: [libc::c_int; 2] = [-1, -1];
    // SAFETY: fds is a valid two-element array for pipe(2) to fill
    if unsafe { libc::pipe(fds.as_mut_ptr()) } < 0 {
        return Err(std::io::Error::last_os_error().into());
    }
    // SAFETY: pipe(2) just handed us ownership of both descriptors
    let read_end = unsafe { OwnedFd::from_raw_fd(fds[0]) };
    // SAFETY: as above
    let write_end = unsafe { OwnedFd::from_raw_fd(fds[1]) };
    set_nonblocking(&read_end)?;
    Ok((read_end, write_end))
}

fn set_nonblocking(fd: &OwnedFd) -> Result<()> {
    // SAFETY: fd is an open descriptor owned by the caller
    let flags = unsafe { libc::fcntl(fd.as_raw_fd(), libc::F_GETFL) };
    if flags < 0 {
        return Err(std::io::Error::last_os_error().into());
    }
    // SAFETY: as above
    if unsafe { libc::fcntl(fd.as_raw_fd(), libc::F_SETFL, flags | libc::O_NONBLOCK) } < 0 {
        return Err(std::io::Error::last_os_error().into());
    }
    Ok(())
}
