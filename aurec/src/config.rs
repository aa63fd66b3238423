//! Daemon configuration.
//!
//! Settings load from a TOML file and reload on SIGHUP.  Every knob has a
//! default so a missing file section never blocks startup.

use std::path::{Path, PathBuf};

use aur_core::{AuditError, CategoryPolicy, Result, ServerMode};
use aur_store::retention::{CleanupPolicy, RetentionParams};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuditSettings {
    /// Master switch; when off, `Supervisor::start` is a no-op.
    pub enabled: bool,
    /// Directory holding the index table and the `<n>_adt` files.
    pub audit_dir: PathBuf,
    /// Node name stamped into every record, if any.
    pub node_name: Option<String>,
    /// Replication role of the enclosing server.
    pub server_mode: ServerMode,
    /// Time-based rotation interval in minutes; 0 disables it.
    pub rotation_age: u64,
    /// Size-based rotation threshold in KiB; 0 disables it.
    pub rotation_size: u64,
    /// Soft bound on total audit bytes, in KiB.
    pub space_limit: u64,
    /// Maximum number of live audit files.
    pub file_remain_threshold: u32,
    /// Minimum file age in days under the time-priority policy.
    pub remain_age: u32,
    /// 0 = time priority, 1 = space priority.
    pub cleanup_policy: u8,
    /// Per-category record/drop switches.
    pub categories: CategoryPolicy,
}

impl Default for AuditSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            audit_dir: PathBuf::from("audit"),
            node_name: None,
            server_mode: ServerMode::Primary,
            rotation_age: 24 * 60,
            rotation_size: 10 * 1024,
            space_limit: 1024 * 1024,
            file_remain_threshold: 1024 * 1024,
            remain_age: 90,
            cleanup_policy: 0,
            categories: CategoryPolicy::default(),
        }
    }
}

impl AuditSettings {
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        toml::from_str(&content)
            .map_err(|e| AuditError::Config(format!("{}: {e}", path.display())))
    }

    #[must_use]
    pub fn rotation_size_bytes(&self) -> u64 {
        self.rotation_size * 1024
    }

    #[must_use]
    pub fn space_limit_bytes(&self) -> u64 {
        self.space_limit * 1024
    }

    #[must_use]
    pub fn remain_age_secs(&self) -> i64 {
        i64::from(self.remain_age) * 24 * 60 * 60
    }

    #[must_use]
    pub fn retention_params(&self) -> RetentionParams {
        RetentionParams {
            space_limit: self.space_limit_bytes(),
            remain_threshold: self.file_remain_threshold,
            remain_age: self.remain_age_secs(),
            policy: CleanupPolicy::from_code(self.cleanup_policy),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_defaults_are_sane() {
        let s = AuditSettings::default();
        assert!(s.enabled);
        assert_eq!(s.rotation_size_bytes(), 10 * 1024 * 1024);
        assert_eq!(s.remain_age_secs(), 90 * 86_400);
    }

    #[test]
    fn test_loads_a_partial_toml_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("audit.toml");
        std::fs::write(
            &path,
            r#"
audit_dir = "/var/lib/db/audit"
rotation_size = 2048
cleanup_policy = 1

[categories]
ddl = true
dml = true

[categories.session]
logout = true
"#,
        )
        .unwrap();

        let s = AuditSettings::from_file(&path).unwrap();
        assert_eq!(s.audit_dir, PathBuf::from("/var/lib/db/audit"));
        assert_eq!(s.rotation_size, 2048);
        assert_eq!(s.cleanup_policy, 1);
        assert!(s.categories.ddl);
        assert!(s.categories.dml);
        assert!(s.categories.session.logout);
        // untouched keys keep their defaults
        assert!(s.categories.session.login_success);
        assert_eq!(s.rotation_age, 24 * 60);
    }

    #[test]
    fn test_rejects_malformed_toml() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("audit.toml");
        std::fs::write(&path, "rotation_size = \"lots\"").unwrap();
        assert!(AuditSettings::from_file(&path).is_err());
    }
}
