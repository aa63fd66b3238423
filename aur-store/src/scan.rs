//! Range queries and soft deletes over the audit archive.
//!
//! Scans are independent of the collector: they load the index table from
//! the target directory, pick the slots whose time window intersects the
//! query range, and walk each file record by record.  Deletes flip the
//! header flags in place; bytes are only ever reclaimed by retention.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;

use aur_core::record::{self, MsgHeader, Record, StringField};
use aur_core::{Result, MSG_HEADER_SIZE, RECORD_HEADER_SIZE, TUPLE_DEAD, TUPLE_LIVE};
use tracing::{debug, warn};

use crate::audit_file::audit_file_path;
use crate::index::{FileCtime, IndexTable};

/// One materialized query row: the record's 13 columns.  Missing string
/// fields render as the literal `"null"`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuditRow {
    pub time: i64,
    pub type_label: &'static str,
    pub result_label: &'static str,
    pub user_id: String,
    pub user_name: String,
    pub database_name: String,
    pub client_conninfo: String,
    pub object_name: String,
    pub detail_info: String,
    pub node_name: String,
    pub thread_id: String,
    pub local_port: String,
    pub remote_port: String,
}

/// Query records with `begtime <= time < endtime` from the archive in
/// `dir`.
pub fn query(dir: &Path, begtime: i64, endtime: i64) -> Result<Vec<AuditRow>> {
    let mut rows = Vec::new();
    for_each_selected_file(dir, begtime, endtime, |path| {
        if let Err(e) = query_file(path, begtime, endtime, &mut rows) {
            warn!(
                target: "aurec::scan",
                file = %path.display(),
                error = %e,
                "could not read audit file"
            );
        }
    })?;
    Ok(rows)
}

/// Soft-delete records with `begtime <= time < endtime`; returns how many
/// records were newly marked.
pub fn soft_delete(dir: &Path, begtime: i64, endtime: i64) -> Result<u64> {
    let mut marked = 0u64;
    for_each_selected_file(dir, begtime, endtime, |path| {
        match delete_file(path, begtime, endtime) {
            Ok(n) => marked += n,
            Err(e) => warn!(
                target: "aurec::scan",
                file = %path.display(),
                error = %e,
                "could not update audit file"
            ),
        }
    })?;
    Ok(marked)
}

fn for_each_selected_file(
    dir: &Path,
    begtime: i64,
    endtime: i64,
    mut visit: impl FnMut(&Path),
) -> Result<()> {
    if begtime >= endtime {
        return Ok(());
    }
    let Some(index) = IndexTable::load(dir)? else {
        return Ok(());
    };
    for idx in index.live_indices() {
        if slot_in_window(&index, idx, begtime, endtime) {
            let path = audit_file_path(dir, index.slot(idx).filenum);
            visit(&path);
        }
    }
    Ok(())
}

/// Whether the slot's file can hold records in `[begtime, endtime)`.
///
/// A slot with a positive ctime covers `[ctime, next slot's ctime)`, or an
/// open-ended window when it is the current slot or its successor has no
/// creation time yet.  A backwards-marked slot was written while the clock
/// ran backwards; its records may carry any timestamp, so it is always
/// visited.
fn slot_in_window(index: &IndexTable, idx: u32, begtime: i64, endtime: i64) -> bool {
    let slot = index.slot(idx);
    let FileCtime::At(ctime) = slot.ctime else {
        return true;
    };
    let Ok(ctime) = i64::try_from(ctime) else {
        return true;
    };

    if idx == index.curidx {
        return ctime <= begtime || ctime < endtime;
    }
    let next = index.slot(index.next_index(idx));
    let FileCtime::At(next_ctime) = next.ctime else {
        return ctime <= begtime || ctime < endtime;
    };
    let Ok(next_ctime) = i64::try_from(next_ctime) else {
        return true;
    };
    ctime.max(begtime) < next_ctime.min(endtime)
}

/// Read one record header + body from the scan position.
///
/// `Ok(None)` is clean end-of-file.  An invalid header stops the file; a
/// short body is reported as a warning and also stops the file.
fn read_record(file: &mut File, path: &Path) -> Result<Option<Vec<u8>>> {
    let mut header = [0u8; MSG_HEADER_SIZE];
    match file.read_exact(&mut header) {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }

    let parsed = match MsgHeader::parse(&header) {
        Ok(parsed) => parsed,
        Err(e) => {
            debug!(
                target: "aurec::scan",
                file = %path.display(),
                error = %e,
                "invalid data in audit file"
            );
            return Ok(None);
        }
    };
    if (parsed.size as usize) < RECORD_HEADER_SIZE {
        debug!(
            target: "aurec::scan",
            file = %path.display(),
            "invalid data in audit file"
        );
        return Ok(None);
    }

    let mut buf = vec![0u8; parsed.size as usize];
    buf[..MSG_HEADER_SIZE].copy_from_slice(&header);
    match file.read_exact(&mut buf[MSG_HEADER_SIZE..]) {
        Ok(()) => Ok(Some(buf)),
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
            warn!(
                target: "aurec::scan",
                file = %path.display(),
                "truncated record at end of audit file"
            );
            Ok(None)
        }
        Err(e) => Err(e.into()),
    }
}

fn query_file(path: &Path, begtime: i64, endtime: i64, rows: &mut Vec<AuditRow>) -> Result<()> {
    let mut file = File::open(path)?;
    while let Some(buf) = read_record(&mut file, path)? {
        let rec = match Record::parse(&buf) {
            Ok(rec) => rec,
            Err(_) => break,
        };
        if rec.header.flags == TUPLE_LIVE
            && rec.header.time >= begtime
            && rec.header.time < endtime
        {
            match materialize(&rec) {
                Ok(row) => rows.push(row),
                Err(e) => {
                    warn!(
                        target: "aurec::scan",
                        file = %path.display(),
                        error = %e,
                        "skipping corrupt audit record"
                    );
                }
            }
        }
    }
    Ok(())
}

fn materialize(rec: &Record<'_>) -> Result<AuditRow> {
    let text = |field: StringField| -> Result<String> {
        Ok(rec
            .field(field)?
            .map_or_else(|| "null".to_owned(), |b| String::from_utf8_lossy(b).into_owned()))
    };
    Ok(AuditRow {
        time: rec.header.time,
        type_label: rec.type_label(),
        result_label: rec.result_label(),
        user_id: text(StringField::UserId)?,
        user_name: text(StringField::UserName)?,
        database_name: text(StringField::DatabaseName)?,
        client_conninfo: text(StringField::ClientConninfo)?,
        object_name: text(StringField::ObjectName)?,
        detail_info: text(StringField::DetailInfo)?,
        node_name: text(StringField::NodeName)?,
        thread_id: text(StringField::ThreadId)?,
        local_port: text(StringField::LocalPort)?,
        remote_port: text(StringField::RemotePort)?,
    })
}

fn delete_file(path: &Path, begtime: i64, endtime: i64) -> Result<u64> {
    let mut file = OpenOptions::new().read(true).write(true).open(path)?;
    let mut marked = 0u64;

    loop {
        let mut header = [0u8; MSG_HEADER_SIZE];
        match file.read_exact(&mut header) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => break,
            Err(e) => return Err(e.into()),
        }
        let Ok(parsed) = MsgHeader::parse(&header) else {
            debug!(
                target: "aurec::scan",
                file = %path.display(),
                "invalid data in audit file"
            );
            break;
        };
        if (parsed.size as usize) < RECORD_HEADER_SIZE {
            break;
        }

        if parsed.flags == TUPLE_LIVE && parsed.time >= begtime && parsed.time < endtime {
            record::set_flags(&mut header, TUPLE_DEAD);
            let back = i64::try_from(MSG_HEADER_SIZE).unwrap_or(0);
            file.seek(SeekFrom::Current(-back))?;
            file.write_all(&header)?;
            marked += 1;
        }
        file.seek(SeekFrom::Current(i64::from(
            parsed.size - u32::try_from(MSG_HEADER_SIZE).unwrap_or(0),
        )))?;
    }

    Ok(marked)
}
