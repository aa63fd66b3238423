//! Database-facing query surface.
//!
//! Range queries and soft deletes run in the calling backend, not in the
//! collector: they load the index table themselves and only ever touch
//! record flags, so they can coexist with a live collector.

use std::path::Path;

use aur_core::{AuditError, Result};
use aur_store::scan;
use aur_store::AuditRow;

use crate::config::AuditSettings;

/// Caller identity for privilege checks.
#[derive(Debug, Clone)]
pub struct Principal {
    pub name: String,
    pub audit_admin: bool,
}

impl Principal {
    #[must_use]
    pub fn audit_admin(name: &str) -> Self {
        Self {
            name: name.to_owned(),
            audit_admin: true,
        }
    }
}

/// Records with `begtime <= time < endtime`, 13 columns per row.
/// `audit_dir` overrides the configured archive location, for inspecting a
/// copied-off archive.
pub fn query_audit(
    principal: &Principal,
    settings: &AuditSettings,
    begtime: i64,
    endtime: i64,
    audit_dir: Option<&Path>,
) -> Result<Vec<AuditRow>> {
    if !principal.audit_admin {
        return Err(AuditError::PermissionDenied("query audit"));
    }
    let dir = audit_dir.unwrap_or_else(|| settings.audit_dir.as_path());
    scan::query(dir, begtime, endtime)
}

/// Soft-delete records with `begtime <= time < endtime`; returns the
/// number of rows newly marked.
pub fn delete_audit(
    principal: &Principal,
    settings: &AuditSettings,
    begtime: i64,
    endtime: i64,
) -> Result<u64> {
    if !principal.audit_admin {
        return Err(AuditError::PermissionDenied("delete audit"));
    }
    scan::soft_delete(&settings.audit_dir, begtime, endtime)
}
