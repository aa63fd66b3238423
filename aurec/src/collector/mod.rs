//! Collector event loop.
//!
//! One long-lived task owns the pipe read end, the index table and the
//! open audit file.  It multiplexes over pipe readability, the rotation
//! timer and control signals; everything else in the process only ever
//! holds the pipe write end.
//!
//! Signal contract: SIGHUP reloads configuration, SIGUSR1 forces a
//! rotation, SIGQUIT shuts down gracefully.  SIGINT/SIGTERM/SIGALRM/
//! SIGPIPE are ignored so the collector outlives its writers and still
//! captures the last records of dying backends; pipe EOF is the normal
//! shutdown trigger.

mod reassembly;

use std::path::PathBuf;
use std::time::Duration;

use aur_core::record::{self, AuditResult, AuditType, RecordFields};
use aur_core::framing::{scan_frame, FrameStep};
use aur_core::{AuditError, Result, MSG_HEADER_SIZE, PIPE_CHUNK_SIZE};
use aur_store::audit_file::AuditFile;
use aur_store::index::{FileCtime, IndexTable};
use aur_store::retention::{run_retention, SpaceWarnState};
use bytes::{Buf, BytesMut};
use chrono::{Local, Offset, TimeZone};
use tokio::net::unix::pipe;
use tokio::signal::unix::{signal, SignalKind};
use tracing::{debug, error, info, warn};

use crate::config::AuditSettings;
use crate::unix_now;
use reassembly::ReassemblyMap;

/// Rolling buffer start size: one chunk being parsed plus one being read.
const READ_BUF_SIZE: usize = 2 * PIPE_CHUNK_SIZE;

type Clock = Box<dyn FnMut() -> i64 + Send>;

enum Wake {
    Reload,
    Rotate,
    Quit,
    Pipe,
    Timer,
}

pub struct Collector {
    settings: AuditSettings,
    config_path: Option<PathBuf>,
    pipe: pipe::Receiver,
    rolling: BytesMut,
    buffers: ReassemblyMap,
    index: IndexTable,
    file: AuditFile,
    /// Bytes in closed live files; the open file reports its own size.
    closed_bytes: u64,
    warn_state: SpaceWarnState,
    rotation_requested: bool,
    rotation_disabled: bool,
    reload_pending: bool,
    shutdown_pending: bool,
    pipe_eof: bool,
    next_rotation_time: Option<i64>,
    clock: Clock,
}

impl Collector {
    /// Bring up the collector state: load or create the index table and
    /// open the current audit file.  Failure here is fatal for the start
    /// attempt — if the audit directory cannot take a file, there is no
    /// point running.
    pub fn new(
        settings: AuditSettings,
        config_path: Option<PathBuf>,
        pipe: pipe::Receiver,
    ) -> Result<Self> {
        Self::with_clock(settings, config_path, pipe, Box::new(unix_now))
    }

    fn with_clock(
        settings: AuditSettings,
        config_path: Option<PathBuf>,
        pipe: pipe::Receiver,
        mut clock: Clock,
    ) -> Result<Self> {
        std::fs::create_dir_all(&settings.audit_dir)?;
        let now = clock();

        let mut index = match IndexTable::load(&settings.audit_dir)? {
            Some(index) => index,
            None => IndexTable::new(settings.file_remain_threshold + 1),
        };

        let filenum = index.current().filenum;
        let (file, existed) = AuditFile::open(&settings.audit_dir, filenum)?;
        if !existed {
            index.current_mut().ctime = FileCtime::At(u64::try_from(now).unwrap_or(0));
        }
        index.recompute_count();
        index.save(&settings.audit_dir)?;

        let closed_bytes = index
            .live_bytes()
            .saturating_sub(u64::from(index.current().filesize));

        let mut collector = Self {
            settings,
            config_path,
            pipe,
            rolling: BytesMut::with_capacity(READ_BUF_SIZE),
            buffers: ReassemblyMap::default(),
            index,
            file,
            closed_bytes,
            warn_state: SpaceWarnState::default(),
            rotation_requested: false,
            rotation_disabled: false,
            reload_pending: false,
            shutdown_pending: false,
            pipe_eof: false,
            next_rotation_time: None,
            clock,
        };
        collector.set_next_rotation_time();
        collector.reinit_index_capacity();
        if collector.file.offset() == 0 {
            collector.emit_internal("file", "create a new audit file");
        }
        Ok(collector)
    }

    pub async fn run(mut self) -> Result<()> {
        let mut sighup = signal(SignalKind::hangup())?;
        let mut sigusr1 = signal(SignalKind::user_defined1())?;
        let mut sigquit = signal(SignalKind::quit())?;
        // registering a stream replaces the default (terminating)
        // disposition; these are deliberately never polled
        let _sigint = signal(SignalKind::interrupt())?;
        let _sigterm = signal(SignalKind::terminate())?;
        let _sigalrm = signal(SignalKind::alarm())?;
        let _sigpipe = signal(SignalKind::pipe())?;

        info!(
            target: "aurec::collector",
            dir = %self.settings.audit_dir.display(),
            "audit collector started"
        );

        loop {
            if self.shutdown_pending {
                break;
            }
            if self.reload_pending {
                self.reload_pending = false;
                self.reload_config();
            }

            self.check_rotation();
            self.run_retention_pass();

            let deadline = self.rotation_deadline();
            let wake = tokio::select! {
                _ = sighup.recv() => Wake::Reload,
                _ = sigusr1.recv() => Wake::Rotate,
                _ = sigquit.recv() => Wake::Quit,
                r = self.pipe.readable() => {
                    match r {
                        Ok(()) => Wake::Pipe,
                        Err(e) => {
                            error!(
                                target: "aurec::collector",
                                error = %e,
                                "could not wait on auditor pipe"
                            );
                            Wake::Quit
                        }
                    }
                }
                () = sleep_until_deadline(deadline) => Wake::Timer,
            };

            match wake {
                Wake::Reload => self.reload_pending = true,
                Wake::Rotate => self.rotation_requested = true,
                Wake::Quit => self.shutdown_pending = true,
                Wake::Timer => {}
                Wake::Pipe => {
                    self.drain_pipe();
                    if self.pipe_eof {
                        break;
                    }
                }
            }
        }

        self.flush_residual();
        self.run_retention_pass();
        if let Err(e) = self.index.save(&self.settings.audit_dir) {
            error!(
                target: "aurec::collector",
                error = %e,
                "could not persist index table at shutdown"
            );
        }
        info!(target: "aurec::collector", "audit collector shutting down");
        Ok(())
    }

    /// One pipe read per wakeup, like one `read(2)` per latch wake.  Zero
    /// bytes on a readable pipe means every write end is closed: all
    /// producers are gone and the collector's work is done.
    fn drain_pipe(&mut self) {
        let mut scratch = [0u8; PIPE_CHUNK_SIZE];
        loop {
            match self.pipe.try_read(&mut scratch) {
                Ok(0) => {
                    self.pipe_eof = true;
                    return;
                }
                Ok(n) => {
                    self.rolling.extend_from_slice(&scratch[..n]);
                    self.process_rolling();
                    return;
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => return,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => {}
                Err(e) => {
                    error!(
                        target: "aurec::collector",
                        error = %e,
                        "could not read from auditor pipe"
                    );
                    return;
                }
            }
        }
    }

    /// Greedily decode frames out of the rolling buffer, reassembling per
    /// producer and appending completed records.  Stray bytes go out
    /// verbatim as standalone writes.
    fn process_rolling(&mut self) {
        loop {
            match scan_frame(&self.rolling) {
                FrameStep::NeedMore => break,
                FrameStep::Chunk {
                    producer,
                    is_last,
                    payload,
                    consumed,
                } => {
                    let payload = self.rolling[payload].to_vec();
                    self.rolling.advance(consumed);
                    if is_last {
                        let record = self.buffers.complete(producer, &payload);
                        self.append_record(record);
                    } else {
                        self.buffers.accumulate(producer, &payload);
                    }
                }
                FrameStep::Stray { len } => {
                    let stray = self.rolling[..len].to_vec();
                    self.rolling.advance(len);
                    debug!(
                        target: "aurec::collector",
                        bytes = stray.len(),
                        "non-protocol data on the auditor pipe"
                    );
                    self.append_record(stray);
                }
            }
        }
    }

    /// Stamp and append one record to the current audit file.
    ///
    /// A wall clock behind the newest stamped record marks the current
    /// slot's ctime negative and records the step-back as an internal
    /// event, so later scans know this file's timestamps are unordered.
    fn append_record(&mut self, mut buf: Vec<u8>) {
        let now = (self.clock)();
        if buf.len() >= MSG_HEADER_SIZE {
            let len = u32::try_from(buf.len()).unwrap_or(u32::MAX);
            record::stamp(&mut buf, now, len);
        }

        if self.index.last_audit_time > now {
            self.index.current_mut().ctime.mark_backwards();
            self.index.last_audit_time = now;
            if let Err(e) = self.index.save(&self.settings.audit_dir) {
                warn!(
                    target: "aurec::collector",
                    error = %e,
                    "could not persist index table"
                );
            }
            self.emit_internal("time", "system time changed.");
        }
        self.index.last_audit_time = now;

        if let Err(e) = self.file.append(&buf) {
            error!(
                target: "aurec::collector",
                error = %e,
                "could not write to audit file"
            );
        }
    }

    /// Collector-originated audit record, appended directly: the pipe is
    /// never writable from the reader side.
    fn emit_internal(&mut self, object: &str, detail: &str) {
        let fields = RecordFields {
            object_name: Some(object.to_owned()),
            detail_info: Some(detail.to_owned()),
            node_name: self.settings.node_name.clone(),
            thread_id: Some(format!("{}@0", std::process::id())),
            ..RecordFields::default()
        };
        let record = fields.encode(AuditType::InternalEvent, AuditResult::Ok);
        self.append_record(record);
    }

    fn check_rotation(&mut self) {
        let mut time_based = false;

        if self.settings.rotation_age > 0 && !self.rotation_disabled {
            let now = (self.clock)();
            if let Some(at) = self.next_rotation_time {
                if now >= at {
                    self.rotation_requested = true;
                    time_based = true;
                }
            }
        }

        if !self.rotation_requested && self.settings.rotation_size > 0 && !self.rotation_disabled {
            let size = self.file.offset();
            if size >= self.settings.rotation_size_bytes()
                || size >= self.settings.space_limit_bytes()
            {
                self.rotation_requested = true;
            }
        }

        if self.rotation_requested {
            // an explicit request (SIGUSR1) with neither trigger rotates
            // on the current time, the same as a size rotation
            self.rotate(time_based);
        }
    }

    /// Close the current file and open its successor.  The new file is
    /// opened first so a failed open keeps the old one in service.
    fn rotate(&mut self, time_based: bool) {
        self.rotation_requested = false;

        // a time rotation names the window from the planned boundary, not
        // "now", so delayed rotations do not slip the schedule
        let fntime = if time_based {
            self.next_rotation_time.unwrap_or_else(|| (self.clock)())
        } else {
            (self.clock)()
        };

        let next_filenum = self.index.current().filenum.wrapping_add(1);
        let (new_file, existed) = match AuditFile::open(&self.settings.audit_dir, next_filenum) {
            Ok(opened) => opened,
            Err(e) => {
                if is_fd_exhaustion(&e) {
                    warn!(
                        target: "aurec::collector",
                        error = %e,
                        "could not open next audit file, keeping the old one"
                    );
                } else {
                    warn!(
                        target: "aurec::collector",
                        error = %e,
                        "disabling automatic rotation (use SIGHUP to re-enable)"
                    );
                    self.rotation_disabled = true;
                }
                return;
            }
        };

        let closed_size = self.file.offset();
        self.index
            .advance_current(u32::try_from(closed_size).unwrap_or(u32::MAX));
        self.closed_bytes += closed_size;
        if !existed {
            self.index.current_mut().ctime = FileCtime::At(u64::try_from(fntime).unwrap_or(0));
        }
        self.index.recompute_count();
        if let Err(e) = self.index.save(&self.settings.audit_dir) {
            warn!(
                target: "aurec::collector",
                error = %e,
                "could not persist index table"
            );
        }

        let fresh = new_file.offset() == 0;
        let old = std::mem::replace(&mut self.file, new_file);
        drop(old);
        debug!(
            target: "aurec::collector",
            filenum = self.file.filenum(),
            "audit file rotated"
        );
        if fresh {
            self.emit_internal("file", "create a new audit file");
        }

        self.set_next_rotation_time();
    }

    fn run_retention_pass(&mut self) {
        let params = self.settings.retention_params();
        let current_size = self.file.offset();
        let evicted = match run_retention(
            &mut self.index,
            &self.settings.audit_dir,
            current_size,
            &mut self.closed_bytes,
            &params,
            &mut self.warn_state,
        ) {
            Ok(evicted) => evicted,
            Err(e) => {
                warn!(
                    target: "aurec::retention",
                    error = %e,
                    "retention pass failed"
                );
                return;
            }
        };
        for filenum in evicted {
            self.emit_internal("file", &format!("remove an audit file(number: {filenum})"));
        }
    }

    fn reload_config(&mut self) {
        if let Some(path) = self.config_path.clone() {
            match AuditSettings::from_file(&path) {
                Err(e) => warn!(
                    target: "aurec::collector",
                    error = %e,
                    "config reload failed, keeping previous audit settings"
                ),
                Ok(mut fresh) => {
                    // the archive location is fixed for the process lifetime
                    fresh.audit_dir = self.settings.audit_dir.clone();
                    let old = std::mem::replace(&mut self.settings, fresh);

                    if old.rotation_age != self.settings.rotation_age {
                        self.set_next_rotation_time();
                    }
                    if old.file_remain_threshold != self.settings.file_remain_threshold {
                        // the in-memory table may be dirty, write it out
                        // before rebuilding at the new capacity
                        if let Err(e) = self.index.save(&self.settings.audit_dir) {
                            warn!(
                                target: "aurec::collector",
                                error = %e,
                                "could not persist index table"
                            );
                        }
                        self.reinit_index_capacity();
                    }
                    info!(target: "aurec::collector", "audit settings reloaded");
                }
            }
        }

        if self.rotation_disabled {
            self.rotation_disabled = false;
            self.rotation_requested = true;
        }
    }

    /// Resize the index ring to the configured retention threshold.
    /// Shrinking runs a retention pass first so the live range fits.
    fn reinit_index_capacity(&mut self) {
        let desired = self.settings.file_remain_threshold + 1;
        if self.index.maxnum() == desired {
            return;
        }
        if self.index.maxnum() > desired {
            IndexTable::unlink(&self.settings.audit_dir);
            self.run_retention_pass();
        }
        self.index = self.index.rebuild(self.settings.file_remain_threshold);
        if let Err(e) = self.index.save(&self.settings.audit_dir) {
            warn!(
                target: "aurec::collector",
                error = %e,
                "could not persist rebuilt index table"
            );
        }
    }

    /// EOF or graceful shutdown: write out every partial per-producer
    /// buffer and any unparsed pipe residue.  Dying backends' half-sent
    /// records are preserved as record prefixes, never dropped.
    fn flush_residual(&mut self) {
        let pending = self.buffers.pending();
        if pending > 0 {
            debug!(
                target: "aurec::collector",
                producers = pending,
                "flushing incomplete records"
            );
        }
        for (_, partial) in self.buffers.drain_partial() {
            self.append_record(partial);
        }
        if !self.rolling.is_empty() {
            let rest = self.rolling.to_vec();
            self.rolling.clear();
            self.append_record(rest);
        }
    }

    fn set_next_rotation_time(&mut self) {
        if self.settings.rotation_age == 0 {
            self.next_rotation_time = None;
            return;
        }
        let interval = i64::try_from(self.settings.rotation_age).unwrap_or(i64::MAX / 60) * 60;
        let now = (self.clock)();
        self.next_rotation_time = Some(next_rotation_boundary(now, interval));
    }

    fn rotation_deadline(&mut self) -> Option<tokio::time::Instant> {
        if self.settings.rotation_age == 0 || self.rotation_disabled {
            return None;
        }
        let at = self.next_rotation_time?;
        let now = (self.clock)();
        let delta = u64::try_from(at - now).unwrap_or(0);
        Some(tokio::time::Instant::now() + Duration::from_secs(delta))
    }
}

fn is_fd_exhaustion(e: &AuditError) -> bool {
    match e {
        AuditError::Io(io) => {
            matches!(io.raw_os_error(), Some(libc::EMFILE) | Some(libc::ENFILE))
        }
        _ => false,
    }
}

async fn sleep_until_deadline(deadline: Option<tokio::time::Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}

/// Next time after `now` that is a whole multiple of `interval` in local
/// time, so rotation lands on minute/hour/day boundaries instead of
/// drifting with collector start time.
fn next_rotation_boundary(now: i64, interval: i64) -> i64 {
    let offset = Local
        .timestamp_opt(now, 0)
        .single()
        .map_or(0, |dt| i64::from(dt.offset().fix().local_minus_utc()));
    let local = now + offset;
    local - local.rem_euclid(interval) + interval - offset
}
