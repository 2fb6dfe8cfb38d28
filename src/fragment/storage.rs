use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io::{Read, Write};
use std::path::Path;

use memmap2::Mmap;
use serde::{Deserialize, Serialize};

use crate::bitmap::{Bitmap, Container};
use crate::error::{DbError, DbResult};

/// Snapshot file magic: "BDFS".
const MAGIC: u32 = 0x4244_4653;
const VERSION: u16 = 1;

/// Fixed on-disk size of one container slot. A bitmap container fills the
/// slot exactly; an array container occupies a prefix.
pub const SLOT_SIZE: usize = 8192;

/// Bytes per entry in the header table:
/// row u64 + key u64 + kind u8 + cardinality u32 + slot u32.
const ENTRY_SIZE: usize = 8 + 8 + 1 + 4 + 4;

/// Fixed header: magic u32, version u16, reserved u16, entry count u32,
/// header table crc u32.
const HEADER_SIZE: usize = 16;

/// Mutations recorded in the fragment op log between snapshots.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum LogOp {
    Set { row: u64, col: u64 },
    Clear { row: u64, col: u64 },
}

/// Write a snapshot atomically: temp file, fsync, rename.
pub fn write_snapshot(path: &Path, rows: &BTreeMap<u64, Bitmap>) -> DbResult<()> {
    let mut entries: Vec<u8> = Vec::new();
    let mut slots: Vec<u8> = Vec::new();
    let mut slot_id: u32 = 0;

    for (row, bitmap) in rows {
        for (key, container) in bitmap.chunks() {
            entries.extend_from_slice(&row.to_le_bytes());
            entries.extend_from_slice(&key.to_le_bytes());
            entries.push(container.kind());
            entries.extend_from_slice(&container.count().to_le_bytes());
            entries.extend_from_slice(&slot_id.to_le_bytes());

            let payload = container.slot_bytes();
            slots.extend_from_slice(&payload);
            slots.resize(slots.len() + (SLOT_SIZE - payload.len()), 0);
            slot_id += 1;
        }
    }

    let mut buf = Vec::with_capacity(HEADER_SIZE + entries.len() + slots.len());
    buf.extend_from_slice(&MAGIC.to_le_bytes());
    buf.extend_from_slice(&VERSION.to_le_bytes());
    buf.extend_from_slice(&0u16.to_le_bytes());
    buf.extend_from_slice(&slot_id.to_le_bytes());
    buf.extend_from_slice(&crc32fast::hash(&entries).to_le_bytes());
    buf.extend_from_slice(&entries);
    buf.extend_from_slice(&slots);

    let tmp = path.with_extension("tmp");
    {
        let mut f = File::create(&tmp)?;
        f.write_all(&buf)?;
        f.sync_all()?;
    }
    std::fs::rename(&tmp, path)?;
    Ok(())
}

/// Load a snapshot into the in-memory row map.
///
/// A missing file is an empty fragment. A bad header is fatal
/// (`CorruptFragment`); a bad individual container is skipped with a
/// warning so one damaged slot does not take out the whole shard.
pub fn read_snapshot(path: &Path) -> DbResult<BTreeMap<u64, Bitmap>> {
    let file = match File::open(path) {
        Ok(f) => f,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(BTreeMap::new()),
        Err(e) => return Err(e.into()),
    };
    let mmap = unsafe { Mmap::map(&file)? };
    let data: &[u8] = &mmap;

    if data.len() < HEADER_SIZE {
        return Err(DbError::CorruptFragment(format!(
            "snapshot {} truncated header",
            path.display()
        )));
    }
    let magic = u32::from_le_bytes(data[0..4].try_into().unwrap());
    let version = u16::from_le_bytes(data[4..6].try_into().unwrap());
    if magic != MAGIC || version != VERSION {
        return Err(DbError::CorruptFragment(format!(
            "snapshot {} bad magic or version",
            path.display()
        )));
    }
    let entry_count = u32::from_le_bytes(data[8..12].try_into().unwrap()) as usize;
    let table_crc = u32::from_le_bytes(data[12..16].try_into().unwrap());

    let table_end = HEADER_SIZE + entry_count * ENTRY_SIZE;
    if data.len() < table_end {
        return Err(DbError::CorruptFragment(format!(
            "snapshot {} truncated entry table",
            path.display()
        )));
    }
    let table = &data[HEADER_SIZE..table_end];
    if crc32fast::hash(table) != table_crc {
        return Err(DbError::CorruptFragment(format!(
            "snapshot {} entry table checksum mismatch",
            path.display()
        )));
    }

    let slots = &data[table_end..];
    let mut rows: BTreeMap<u64, Bitmap> = BTreeMap::new();
    for entry in table.chunks_exact(ENTRY_SIZE) {
        let row = u64::from_le_bytes(entry[0..8].try_into().unwrap());
        let key = u64::from_le_bytes(entry[8..16].try_into().unwrap());
        let kind = entry[16];
        let n = u32::from_le_bytes(entry[17..21].try_into().unwrap());
        let slot = u32::from_le_bytes(entry[21..25].try_into().unwrap()) as usize;

        let start = slot * SLOT_SIZE;
        let len = match kind {
            0 => n as usize * 2,
            _ => SLOT_SIZE,
        };
        if start + len > slots.len() {
            tracing::warn!(row, key, slot, "container slot out of bounds, skipping");
            continue;
        }
        match Container::from_slot_bytes(kind, n, &slots[start..start + len]) {
            Ok(container) => rows.entry(row).or_default().insert_chunk(key, container),
            Err(e) => {
                tracing::warn!(row, key, error = %e, "corrupt container, skipping");
            }
        }
    }
    Ok(rows)
}

/// Bounded append-only log of mutations not yet captured by a snapshot.
///
/// Entries are length-prefixed bincode with a crc32 trailer. Replay stops
/// at the first damaged entry, so a crash loses at most the uncommitted
/// tail.
pub struct OpLog {
    file: File,
    entries: usize,
}

impl OpLog {
    pub fn open(path: &Path) -> DbResult<(OpLog, Vec<LogOp>)> {
        let ops = Self::replay(path)?;
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok((
            OpLog {
                file,
                entries: ops.len(),
            },
            ops,
        ))
    }

    fn replay(path: &Path) -> DbResult<Vec<LogOp>> {
        let mut buf = Vec::new();
        match File::open(path) {
            Ok(mut f) => {
                f.read_to_end(&mut buf)?;
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        }

        let mut ops = Vec::new();
        let mut pos = 0usize;
        while pos + 4 <= buf.len() {
            let len = u32::from_be_bytes(buf[pos..pos + 4].try_into().unwrap()) as usize;
            let end = pos + 4 + len + 4;
            if end > buf.len() {
                tracing::warn!(path = %path.display(), "op log tail truncated, dropping");
                break;
            }
            let payload = &buf[pos + 4..pos + 4 + len];
            let crc = u32::from_be_bytes(buf[pos + 4 + len..end].try_into().unwrap());
            if crc32fast::hash(payload) != crc {
                tracing::warn!(path = %path.display(), "op log entry checksum mismatch, dropping tail");
                break;
            }
            match bincode::deserialize::<LogOp>(payload) {
                Ok(op) => ops.push(op),
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "undecodable op log entry, dropping tail");
                    break;
                }
            }
            pos = end;
        }
        Ok(ops)
    }

    pub fn append(&mut self, op: &LogOp) -> DbResult<()> {
        let payload = bincode::serialize(op)?;
        let mut frame = Vec::with_capacity(payload.len() + 8);
        frame.extend_from_slice(&(payload.len() as u32).to_be_bytes());
        frame.extend_from_slice(&payload);
        frame.extend_from_slice(&crc32fast::hash(&payload).to_be_bytes());
        self.file.write_all(&frame)?;
        self.entries += 1;
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.entries
    }

    pub fn is_empty(&self) -> bool {
        self.entries == 0
    }

    /// Discard all entries after a successful snapshot. The handle is in
    /// append mode, so subsequent writes start from the new end.
    pub fn truncate(&mut self) -> DbResult<()> {
        self.file.set_len(0)?;
        self.file.sync_all()?;
        self.entries = 0;
        Ok(())
    }

    pub fn sync(&mut self) -> DbResult<()> {
        self.file.sync_all()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rows_fixture() -> BTreeMap<u64, Bitmap> {
        let mut rows = BTreeMap::new();
        rows.insert(10, Bitmap::from_columns(&[3, 70000, (1 << 20) + 1]));
        let mut dense = Bitmap::new();
        for col in 0..5000u64 {
            dense.set(col).unwrap();
        }
        rows.insert(11, dense);
        rows
    }

    #[test]
    fn test_snapshot_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("0");

        let rows = rows_fixture();
        write_snapshot(&path, &rows).unwrap();
        let back = read_snapshot(&path).unwrap();
        assert_eq!(rows, back);
    }

    #[test]
    fn test_missing_snapshot_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let rows = read_snapshot(&dir.path().join("nope")).unwrap();
        assert!(rows.is_empty());
    }

    #[test]
    fn test_corrupt_header_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("0");
        write_snapshot(&path, &rows_fixture()).unwrap();

        let mut bytes = std::fs::read(&path).unwrap();
        bytes[17] ^= 0xFF; // flip a bit inside the entry table
        std::fs::write(&path, &bytes).unwrap();

        assert!(matches!(
            read_snapshot(&path),
            Err(DbError::CorruptFragment(_))
        ));
    }

    #[test]
    fn test_op_log_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("0.op");

        let ops = vec![
            LogOp::Set { row: 10, col: 3 },
            LogOp::Set { row: 10, col: 70000 },
            LogOp::Clear { row: 10, col: 3 },
        ];
        {
            let (mut log, replayed) = OpLog::open(&path).unwrap();
            assert!(replayed.is_empty());
            for op in &ops {
                log.append(op).unwrap();
            }
            log.sync().unwrap();
        }

        let (log, replayed) = OpLog::open(&path).unwrap();
        assert_eq!(replayed, ops);
        assert_eq!(log.len(), 3);
    }

    #[test]
    fn test_op_log_truncated_tail_dropped() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("0.op");
        {
            let (mut log, _) = OpLog::open(&path).unwrap();
            log.append(&LogOp::Set { row: 1, col: 2 }).unwrap();
            log.append(&LogOp::Set { row: 3, col: 4 }).unwrap();
            log.sync().unwrap();
        }

        // Chop bytes off the end to simulate a crash mid-append.
        let bytes = std::fs::read(&path).unwrap();
        std::fs::write(&path, &bytes[..bytes.len() - 3]).unwrap();

        let (_, replayed) = OpLog::open(&path).unwrap();
        assert_eq!(replayed, vec![LogOp::Set { row: 1, col: 2 }]);
    }

    #[test]
    fn test_op_log_truncate_resets() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("0.op");
        let (mut log, _) = OpLog::open(&path).unwrap();
        log.append(&LogOp::Set { row: 1, col: 2 }).unwrap();
        log.truncate().unwrap();
        assert!(log.is_empty());

        let (_, replayed) = OpLog::open(&path).unwrap();
        assert!(replayed.is_empty());
    }
}
