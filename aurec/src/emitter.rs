//! Producer-side audit emitter.
//!
//! Every backend holds an `Emitter`: the pipe write end plus an immutable
//! snapshot of the category policy and node identity.  Reporting never
//! fails the caller — audit is a side channel, and a producer that cannot
//! record an event has no better place to complain than the host log.

use std::os::fd::{AsRawFd, OwnedFd};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use aur_core::framing::encode_chunks;
use aur_core::record::{AuditResult, AuditType, RecordFields};
use aur_core::{CategoryPolicy, ServerMode};
use tracing::{info, warn};

use crate::config::AuditSettings;
use crate::unix_now;

/// Connection identity a backend attaches to its records.
#[derive(Debug, Clone, Default)]
pub struct SessionInfo {
    pub user_id: Option<String>,
    pub user_name: Option<String>,
    pub database_name: Option<String>,
    pub application_name: Option<String>,
    pub remote_host: Option<String>,
    pub local_port: Option<u16>,
    pub remote_port: Option<String>,
}

pub struct Emitter {
    pipe: Option<Arc<OwnedFd>>,
    policy: CategoryPolicy,
    mode: ServerMode,
    enabled: bool,
    node_name: Option<String>,
    session: Option<SessionInfo>,
    producer_id: u64,
    /// Refreshed whenever a login category is reported; composed into the
    /// thread-id field as `<pid>@<login-ts>`.
    login_time: AtomicI64,
}

impl Emitter {
    pub(crate) fn new(pipe: Option<Arc<OwnedFd>>, settings: &AuditSettings) -> Self {
        Self {
            pipe,
            policy: settings.categories,
            mode: settings.server_mode,
            enabled: settings.enabled,
            node_name: settings.node_name.clone(),
            session: None,
            producer_id: u64::from(std::process::id()),
            login_time: AtomicI64::new(0),
        }
    }

    #[must_use]
    pub fn with_session(mut self, session: SessionInfo) -> Self {
        self.session = Some(session);
        self
    }

    /// Override the producer id (defaults to the process id).  Zero is the
    /// wire protocol's "no producer" and is ignored.
    #[must_use]
    pub fn with_producer_id(mut self, id: u64) -> Self {
        if id != 0 {
            self.producer_id = id;
        }
        self
    }

    /// Record one audit event.
    ///
    /// Dropped silently when auditing is off, the server is not primary,
    /// or the event's category is disabled by policy.  Unknown categories
    /// are dropped with a warning.
    pub fn report(
        &self,
        atype: AuditType,
        result: AuditResult,
        object_name: Option<&str>,
        detail_info: Option<&str>,
    ) {
        if !self.enabled || !self.mode.records_audit() {
            return;
        }
        if atype.is_login() {
            self.login_time.store(unix_now(), Ordering::Relaxed);
        }
        match self.policy.permits(atype) {
            Some(true) => {}
            Some(false) => return,
            None => {
                warn!(target: "aurec::emitter", "unknown audit type, discard it");
                return;
            }
        }

        let record = self
            .build_fields(object_name, detail_info)
            .encode(atype, result);

        match &self.pipe {
            Some(fd) => {
                for chunk in encode_chunks(self.producer_id, &record) {
                    write_chunk(fd, &chunk);
                }
            }
            None => {
                // collector not wired up yet; the host log is the fallback
                info!(
                    target: "aurec::emitter",
                    detail = detail_info.unwrap_or_default(),
                    "discard audit data"
                );
            }
        }
    }

    fn build_fields(&self, object_name: Option<&str>, detail_info: Option<&str>) -> RecordFields {
        let mut fields = RecordFields {
            object_name: object_name.map(str::to_owned),
            detail_info: detail_info.map(str::to_owned),
            node_name: self.node_name.clone(),
            thread_id: Some(format!(
                "{}@{}",
                self.producer_id,
                self.login_time.load(Ordering::Relaxed)
            )),
            ..RecordFields::default()
        };
        if let Some(session) = &self.session {
            fields.user_id = Some(session.user_id.clone().unwrap_or_else(|| "0".to_owned()));
            fields.user_name = Some(or_unknown(&session.user_name));
            fields.database_name = Some(or_unknown(&session.database_name));
            fields.client_conninfo = Some(format!(
                "{}@{}",
                or_unknown(&session.application_name),
                or_unknown(&session.remote_host)
            ));
            fields.local_port = session.local_port.map(|p| p.to_string());
            fields.remote_port = session.remote_port.clone();
        }
        fields
    }
}

fn or_unknown(value: &Option<String>) -> String {
    value
        .clone()
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| "[unknown]".to_owned())
}

/// One `write(2)` per chunk; the pipe guarantees atomicity for writes of
/// chunk size.  The result is ignored: a producer cannot recover from a
/// failed audit write, and retrying against a dead collector never ends.
fn write_chunk(fd: &OwnedFd, chunk: &[u8]) {
    // SAFETY: fd is an open pipe write end and chunk outlives the call
    let rc = unsafe {
        libc::write(
            fd.as_raw_fd(),
            chunk.as_ptr().cast::<libc::c_void>(),
            chunk.len(),
        )
    };
    let _ = rc;
}
