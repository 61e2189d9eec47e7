use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::storage::snapshot::checksum;

const LOG_MAGIC: u32 = 0x314C_4B43; // "CKL1"
const LOG_VERSION: u32 = 1;

/// 一次成功提交的写集合；`version` 为提交序号，回放时跳过已包含在快照里的记录
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub(crate) struct CommitRecord {
    pub version: u64,
    pub writes: Vec<(String, Option<Vec<u8>>)>,
}

#[derive(Debug, Default)]
pub(crate) struct ReplayResult {
    pub records: Vec<CommitRecord>,
    pub truncated_tail_records: usize,
}

/// Append-only 提交日志。
///
/// 记录格式：`len(u32) | checksum(u32) | bincode(CommitRecord)`。
/// 追加后立即 fsync；尾部截断/校验失败的记录在回放时丢弃（该提交从未向调用方确认）。
pub(crate) struct CommitLog {
    path: PathBuf,
    file: Mutex<File>,
}

impl CommitLog {
    pub(crate) fn open(path: PathBuf) -> anyhow::Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let f = open_or_init(&path)?;
        Ok(Self {
            path,
            file: Mutex::new(f),
        })
    }

    pub(crate) fn append(&self, rec: &CommitRecord) -> anyhow::Result<()> {
        let payload = bincode::serialize(rec)?;
        let len: u32 = payload
            .len()
            .try_into()
            .map_err(|_| anyhow::anyhow!("Commit record too large ({} bytes)", payload.len()))?;
        let mut frame = Vec::with_capacity(8 + payload.len());
        frame.extend_from_slice(&len.to_le_bytes());
        frame.extend_from_slice(&checksum(&payload).to_le_bytes());
        frame.extend_from_slice(&payload);

        let mut f = self.file.lock();
        f.write_all(&frame)?;
        f.sync_data()?;
        Ok(())
    }

    /// 快照落盘后清空日志（只保留 header）
    pub(crate) fn reset(&self) -> anyhow::Result<()> {
        let mut f = self.file.lock();
        f.flush()?;
        let mut nf = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&self.path)?;
        write_header(&mut nf)?;
        nf.sync_all()?;
        drop(nf);
        *f = OpenOptions::new().read(true).append(true).open(&self.path)?;
        Ok(())
    }

    pub(crate) fn replay(&self) -> anyhow::Result<ReplayResult> {
        let _guard = self.file.lock();
        read_log_file(&self.path)
    }
}

fn write_header(f: &mut File) -> std::io::Result<()> {
    f.write_all(&LOG_MAGIC.to_le_bytes())?;
    f.write_all(&LOG_VERSION.to_le_bytes())?;
    f.flush()
}

fn open_or_init(path: &Path) -> anyhow::Result<File> {
    let exists = path.exists();
    let mut f = OpenOptions::new()
        .create(true)
        .read(true)
        .append(true)
        .open(path)?;

    if !exists {
        write_header(&mut f)?;
        return Ok(f);
    }

    let mut hdr = [0u8; 8];
    f.seek(SeekFrom::Start(0))?;
    let valid = match f.read_exact(&mut hdr) {
        Ok(()) => {
            let magic = u32::from_le_bytes(hdr[0..4].try_into()?);
            let ver = u32::from_le_bytes(hdr[4..8].try_into()?);
            magic == LOG_MAGIC && ver == LOG_VERSION
        }
        Err(_) => false,
    };
    if valid {
        return Ok(f);
    }

    // header 缺失或不兼容：重建空日志（快照仍是权威数据）
    tracing::warn!("Commit log {:?} has an invalid header, starting a fresh log", path);
    let mut nf = OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open(path)?;
    write_header(&mut nf)?;
    drop(nf);
    Ok(OpenOptions::new().read(true).append(true).open(path)?)
}

fn read_log_file(path: &Path) -> anyhow::Result<ReplayResult> {
    if !path.exists() {
        return Ok(ReplayResult::default());
    }
    let mut f = File::open(path)?;

    let mut hdr = [0u8; 8];
    if f.read_exact(&mut hdr).is_err() {
        return Ok(ReplayResult::default());
    }
    let magic = u32::from_le_bytes(hdr[0..4].try_into()?);
    let ver = u32::from_le_bytes(hdr[4..8].try_into()?);
    if magic != LOG_MAGIC || ver != LOG_VERSION {
        return Ok(ReplayResult::default());
    }

    let mut out = ReplayResult::default();
    loop {
        let mut lb = [0u8; 8];
        if f.read_exact(&mut lb).is_err() {
            break;
        }
        let len = u32::from_le_bytes(lb[0..4].try_into()?) as usize;
        let sum = u32::from_le_bytes(lb[4..8].try_into()?);
        let mut buf = vec![0u8; len];
        if f.read_exact(&mut buf).is_err() {
            out.truncated_tail_records += 1;
            break;
        }
        if checksum(&buf) != sum {
            out.truncated_tail_records += 1;
            break;
        }
        match bincode::deserialize::<CommitRecord>(&buf) {
            Ok(rec) => out.records.push(rec),
            Err(e) => {
                tracing::warn!("Undecodable commit record, stopping replay: {}", e);
                out.truncated_tail_records += 1;
                break;
            }
        }
    }
    Ok(out)
}
