//! Audit record codec.
//!
//! A record is a fixed little-endian header followed by a contiguous
//! length-prefixed string region:
//!
//! - signature `"AU"` (2), version (2), field count (2), flags (2),
//!   creation time (8, signed epoch seconds), total size (4, includes the
//!   header);
//! - audit type (4) and result (4);
//! - ten string fields, each a `u32` length followed by that many bytes.
//!   A length of 0 encodes an absent (NULL) field.
//!
//! Producers encode with zeroed time/size placeholders; the collector
//! stamps both in place at append time.

use crate::{
    AuditError, Result, AUDIT_FIELD_COUNT, AUDIT_SIGNATURE, AUDIT_STRING_FIELDS, AUDIT_VERSION,
    MSG_HEADER_SIZE, RECORD_HEADER_SIZE, TUPLE_DEAD, TUPLE_LIVE,
};

/// Audit event category.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum AuditType {
    Unknown = 0,
    LoginSuccess = 1,
    LoginFailed = 2,
    UserLogout = 3,
    SystemStart = 4,
    SystemStop = 5,
    SystemRecover = 6,
    SystemSwitch = 7,
    LockUser = 8,
    UnlockUser = 9,
    GrantRole = 10,
    RevokeRole = 11,
    UserViolation = 12,
    DdlDatabase = 13,
    DdlDirectory = 14,
    DdlTablespace = 15,
    DdlSchema = 16,
    DdlUser = 17,
    DdlTable = 18,
    DdlIndex = 19,
    DdlView = 20,
    DdlTrigger = 21,
    DdlFunction = 22,
    DdlResourcePool = 23,
    DdlWorkload = 24,
    DdlServerForHadoop = 25,
    DdlDataSource = 26,
    DdlNodeGroup = 27,
    DdlRowLevelSecurity = 28,
    DdlSynonym = 29,
    DdlType = 30,
    DdlTextSearch = 31,
    DmlAction = 32,
    DmlActionSelect = 33,
    InternalEvent = 34,
    FunctionExec = 35,
    CopyTo = 36,
    CopyFrom = 37,
    SetParameter = 38,
}

const TYPE_LABELS: [&str; 39] = [
    "unknown",
    "login_success",
    "login_failed",
    "user_logout",
    "system_start",
    "system_stop",
    "system_recover",
    "system_switch",
    "lock_user",
    "unlock_user",
    "grant_role",
    "revoke_role",
    "user_violation",
    "ddl_database",
    "ddl_directory",
    "ddl_tablespace",
    "ddl_schema",
    "ddl_user",
    "ddl_table",
    "ddl_index",
    "ddl_view",
    "ddl_trigger",
    "ddl_function",
    "ddl_resourcepool",
    "ddl_workload",
    "ddl_serverforhadoop",
    "ddl_datasource",
    "ddl_nodegroup",
    "ddl_rowlevelsecurity",
    "ddl_synonym",
    "ddl_type",
    "ddl_textsearch",
    "dml_action",
    "dml_action_select",
    "internal_event",
    "function_exec",
    "copy_to",
    "copy_from",
    "set_parameter",
];

impl AuditType {
    /// Human-readable label; out-of-range values map to `"unknown"`.
    #[must_use]
    pub fn label(self) -> &'static str {
        TYPE_LABELS[self as usize]
    }

    #[must_use]
    pub fn label_of(raw: u32) -> &'static str {
        TYPE_LABELS.get(raw as usize).copied().unwrap_or(TYPE_LABELS[0])
    }

    /// Session categories refresh the emitter's login timestamp.
    #[must_use]
    pub fn is_login(self) -> bool {
        matches!(self, Self::LoginSuccess | Self::LoginFailed)
    }

    #[must_use]
    pub fn is_ddl(self) -> bool {
        (self as u32) >= Self::DdlDatabase as u32 && (self as u32) <= Self::DdlTextSearch as u32
    }
}

/// Outcome recorded with an audit event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum AuditResult {
    Unknown = 0,
    Ok = 1,
    Failed = 2,
}

impl AuditResult {
    #[must_use]
    pub fn label(self) -> &'static str {
        match self {
            Self::Unknown => "unknown",
            Self::Ok => "ok",
            Self::Failed => "failed",
        }
    }

    #[must_use]
    pub fn label_of(raw: u32) -> &'static str {
        match raw {
            1 => "ok",
            2 => "failed",
            _ => "unknown",
        }
    }
}

/// Ordinal of a string field within the record body.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StringField {
    UserId = 0,
    UserName = 1,
    DatabaseName = 2,
    ClientConninfo = 3,
    ObjectName = 4,
    DetailInfo = 5,
    NodeName = 6,
    ThreadId = 7,
    LocalPort = 8,
    RemotePort = 9,
}

/// Parsed fixed message header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MsgHeader {
    pub flags: u16,
    pub time: i64,
    pub size: u32,
}

impl MsgHeader {
    /// Parse and validate the 20-byte header prefix of `buf`.
    pub fn parse(buf: &[u8]) -> Result<Self> {
        if buf.len() < MSG_HEADER_SIZE {
            return Err(AuditError::InvalidRecordHeader {
                offset: 0,
                reason: "truncated header",
            });
        }
        if buf[0..2] != AUDIT_SIGNATURE {
            return Err(AuditError::InvalidRecordHeader {
                offset: 0,
                reason: "bad signature",
            });
        }
        let version = u16::from_le_bytes([buf[2], buf[3]]);
        let fields = u16::from_le_bytes([buf[4], buf[5]]);
        if version != AUDIT_VERSION {
            return Err(AuditError::InvalidRecordHeader {
                offset: 0,
                reason: "unsupported version",
            });
        }
        if fields != AUDIT_FIELD_COUNT {
            return Err(AuditError::InvalidRecordHeader {
                offset: 0,
                reason: "unexpected field count",
            });
        }
        let flags = u16::from_le_bytes([buf[6], buf[7]]);
        if flags != TUPLE_LIVE && flags != TUPLE_DEAD {
            return Err(AuditError::InvalidRecordHeader {
                offset: 0,
                reason: "flags out of domain",
            });
        }
        let time = i64::from_le_bytes([
            buf[8], buf[9], buf[10], buf[11], buf[12], buf[13], buf[14], buf[15],
        ]);
        let size = u32::from_le_bytes([buf[16], buf[17], buf[18], buf[19]]);
        Ok(Self { flags, time, size })
    }

    /// Serialize the full 20-byte header.
    #[must_use]
    pub fn encode(&self) -> [u8; MSG_HEADER_SIZE] {
        let mut out = [0u8; MSG_HEADER_SIZE];
        out[0..2].copy_from_slice(&AUDIT_SIGNATURE);
        out[2..4].copy_from_slice(&AUDIT_VERSION.to_le_bytes());
        out[4..6].copy_from_slice(&AUDIT_FIELD_COUNT.to_le_bytes());
        out[6..8].copy_from_slice(&self.flags.to_le_bytes());
        out[8..16].copy_from_slice(&self.time.to_le_bytes());
        out[16..20].copy_from_slice(&self.size.to_le_bytes());
        out
    }
}

/// Overwrite the time and size words of an encoded record in place.
///
/// The collector stamps every record at append time so producers never
/// need a consistent clock.
pub fn stamp(buf: &mut [u8], time: i64, size: u32) {
    if buf.len() >= MSG_HEADER_SIZE {
        buf[8..16].copy_from_slice(&time.to_le_bytes());
        buf[16..20].copy_from_slice(&size.to_le_bytes());
    }
}

/// Overwrite the flags word of an encoded header in place.
pub fn set_flags(buf: &mut [u8], flags: u16) {
    if buf.len() >= 8 {
        buf[6..8].copy_from_slice(&flags.to_le_bytes());
    }
}

/// The ten string fields of a record, in wire order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecordFields {
    pub user_id: Option<String>,
    pub user_name: Option<String>,
    pub database_name: Option<String>,
    pub client_conninfo: Option<String>,
    pub object_name: Option<String>,
    pub detail_info: Option<String>,
    pub node_name: Option<String>,
    pub thread_id: Option<String>,
    pub local_port: Option<String>,
    pub remote_port: Option<String>,
}

impl RecordFields {
    fn ordered(&self) -> [Option<&str>; AUDIT_STRING_FIELDS] {
        [
            self.user_id.as_deref(),
            self.user_name.as_deref(),
            self.database_name.as_deref(),
            self.client_conninfo.as_deref(),
            self.object_name.as_deref(),
            self.detail_info.as_deref(),
            self.node_name.as_deref(),
            self.thread_id.as_deref(),
            self.local_port.as_deref(),
            self.remote_port.as_deref(),
        ]
    }

    /// Encode a complete record with zeroed time/size placeholders.
    #[must_use]
    pub fn encode(&self, atype: AuditType, result: AuditResult) -> Vec<u8> {
        let body: usize = self
            .ordered()
            .iter()
            .map(|f| 4 + f.map_or(0, str::len))
            .sum();
        let mut buf = Vec::with_capacity(RECORD_HEADER_SIZE + body);

        let header = MsgHeader {
            flags: TUPLE_LIVE,
            time: 0,
            size: 0,
        };
        buf.extend_from_slice(&header.encode());
        buf.extend_from_slice(&(atype as u32).to_le_bytes());
        buf.extend_from_slice(&(result as u32).to_le_bytes());

        for field in self.ordered() {
            match field {
                Some(s) => {
                    buf.extend_from_slice(&u32_len(s).to_le_bytes());
                    buf.extend_from_slice(s.as_bytes());
                }
                None => buf.extend_from_slice(&0u32.to_le_bytes()),
            }
        }
        buf
    }
}

#[allow(clippy::cast_possible_truncation)]
fn u32_len(s: &str) -> u32 {
    s.len() as u32
}

/// Borrowed view over a complete encoded record.
#[derive(Debug)]
pub struct Record<'a> {
    pub header: MsgHeader,
    pub atype_raw: u32,
    pub result_raw: u32,
    strings: &'a [u8],
}

impl<'a> Record<'a> {
    /// Parse a record occupying exactly `buf`.
    pub fn parse(buf: &'a [u8]) -> Result<Self> {
        let header = MsgHeader::parse(buf)?;
        if (header.size as usize) != buf.len() || (header.size as usize) < RECORD_HEADER_SIZE {
            return Err(AuditError::InvalidRecordHeader {
                offset: 0,
                reason: "size does not match record length",
            });
        }
        let atype_raw = u32::from_le_bytes([buf[20], buf[21], buf[22], buf[23]]);
        let result_raw = u32::from_le_bytes([buf[24], buf[25], buf[26], buf[27]]);
        Ok(Self {
            header,
            atype_raw,
            result_raw,
            strings: &buf[RECORD_HEADER_SIZE..],
        })
    }

    #[must_use]
    pub fn type_label(&self) -> &'static str {
        AuditType::label_of(self.atype_raw)
    }

    #[must_use]
    pub fn result_label(&self) -> &'static str {
        AuditResult::label_of(self.result_raw)
    }

    /// Fetch a string field by ordinal as a borrowed slice.
    ///
    /// Returns `Ok(None)` for an absent field; a length prefix that
    /// overruns the string region makes the record corrupt.
    pub fn field(&self, which: StringField) -> Result<Option<&'a [u8]>> {
        let want = which as usize;
        let mut rest = self.strings;
        for index in 0..=want {
            if rest.len() < 4 {
                return Err(AuditError::CorruptRecord { field: index });
            }
            let len = u32::from_le_bytes([rest[0], rest[1], rest[2], rest[3]]) as usize;
            rest = &rest[4..];
            if len > rest.len() {
                return Err(AuditError::CorruptRecord { field: index });
            }
            if index == want {
                return Ok(if len == 0 { None } else { Some(&rest[..len]) });
            }
            rest = &rest[len..];
        }
        Ok(None)
    }
}
