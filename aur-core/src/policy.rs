//! Audit policy: which event categories are recorded.

use serde::{Deserialize, Serialize};

use crate::record::AuditType;

/// Session events are gated per sub-kind rather than as a single switch.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionFlags {
    pub login_success: bool,
    pub login_failed: bool,
    pub logout: bool,
}

impl Default for SessionFlags {
    fn default() -> Self {
        Self {
            login_success: true,
            login_failed: true,
            logout: false,
        }
    }
}

/// Per-category enable flags consumed by the producer-side filter.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct CategoryPolicy {
    pub session: SessionFlags,
    pub server_action: bool,
    pub lock_user: bool,
    pub privilege_admin: bool,
    pub user_violation: bool,
    pub ddl: bool,
    pub dml: bool,
    pub dml_select: bool,
    pub exec: bool,
    pub copy: bool,
    pub set: bool,
}

impl Default for CategoryPolicy {
    fn default() -> Self {
        Self {
            session: SessionFlags::default(),
            server_action: true,
            lock_user: true,
            privilege_admin: false,
            user_violation: false,
            ddl: false,
            dml: false,
            dml_select: false,
            exec: false,
            copy: false,
            set: false,
        }
    }
}

impl CategoryPolicy {
    /// Whether `atype` should be recorded under this policy.
    ///
    /// Returns `None` for [`AuditType::Unknown`] so the caller can warn and
    /// drop.  Internal events are never filtered.
    #[must_use]
    pub fn permits(&self, atype: AuditType) -> Option<bool> {
        use AuditType as T;
        let on = match atype {
            T::Unknown => return None,
            T::LoginSuccess => self.session.login_success,
            T::LoginFailed => self.session.login_failed,
            T::UserLogout => self.session.logout,
            T::SystemStart | T::SystemStop | T::SystemRecover | T::SystemSwitch => {
                self.server_action
            }
            T::LockUser | T::UnlockUser => self.lock_user,
            T::GrantRole | T::RevokeRole => self.privilege_admin,
            T::UserViolation => self.user_violation,
            T::DmlAction => self.dml,
            T::DmlActionSelect => self.dml_select,
            T::InternalEvent => true,
            T::FunctionExec => self.exec,
            T::CopyTo | T::CopyFrom => self.copy,
            T::SetParameter => self.set,
            ddl if ddl.is_ddl() => self.ddl,
            _ => return None,
        };
        Some(on)
    }
}

/// Replication role of the enclosing server.  Only a primary records audit
/// events; standby and pending nodes suppress them at the source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServerMode {
    #[default]
    Primary,
    Standby,
    Pending,
}

impl ServerMode {
    #[must_use]
    pub fn records_audit(self) -> bool {
        self == Self::Primary
    }
}
