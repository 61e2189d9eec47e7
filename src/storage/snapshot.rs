use std::io::{Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::Serialize;

/// 快照文件 Header
const MAGIC: u32 = 0x4B42_5301; // "KBS\x01"
const VERSION_CURRENT: u32 = 1;
const STATE_COMMITTED: u32 = 0x0000_0001;
const STATE_INCOMPLETE: u32 = 0xFFFF_FFFF;
const HEADER_SIZE: usize = 4 + 4 + 4 + 8 + 4; // magic + version + state + data_len + checksum

/// 本地 KV 的原子快照（atomic replacement）
///
/// 落盘流程：
/// 1) 写 kv.snap.tmp 的 INCOMPLETE header（len/checksum 先置 0）
/// 2) `bincode::serialize_into` 流式写 body，边写边算 checksum / data_len
/// 3) seek 回开头覆盖 COMMITTED header
/// 4) fsync(tmpfile)
/// 5) rename(tmp, target)
/// 6) fsync(dir)
///
/// 加载时校验 magic + version + state + data_len + checksum，任何不一致都视为无快照。
pub(crate) struct SnapshotStore {
    path: PathBuf,
}

pub(crate) struct SimpleChecksum {
    hash: u32,
    pending: [u8; 4],
    pending_len: usize,
}

impl SimpleChecksum {
    pub(crate) fn new() -> Self {
        Self {
            hash: 0,
            pending: [0u8; 4],
            pending_len: 0,
        }
    }

    pub(crate) fn update(&mut self, mut data: &[u8]) {
        if self.pending_len > 0 {
            let take = (4 - self.pending_len).min(data.len());
            self.pending[self.pending_len..self.pending_len + take].copy_from_slice(&data[..take]);
            self.pending_len += take;
            data = &data[take..];
            if self.pending_len == 4 {
                self.process_chunk(self.pending);
                self.pending_len = 0;
                self.pending = [0u8; 4];
            }
        }

        let mut chunks = data.chunks_exact(4);
        for chunk in &mut chunks {
            self.process_chunk([chunk[0], chunk[1], chunk[2], chunk[3]]);
        }
        let rest = chunks.remainder();
        if !rest.is_empty() {
            self.pending[..rest.len()].copy_from_slice(rest);
            self.pending_len = rest.len();
        }
    }

    pub(crate) fn finalize(mut self) -> u32 {
        if self.pending_len > 0 {
            let mut buf = [0u8; 4];
            buf[..self.pending_len].copy_from_slice(&self.pending[..self.pending_len]);
            self.process_chunk(buf);
        }
        self.hash
    }

    fn process_chunk(&mut self, chunk: [u8; 4]) {
        self.hash = self.hash.wrapping_add(u32::from_le_bytes(chunk));
        self.hash = self.hash.rotate_left(7);
    }
}

/// 简单校验和（非加密，仅用于发现截断/随机翻转）
pub(crate) fn checksum(data: &[u8]) -> u32 {
    let mut c = SimpleChecksum::new();
    c.update(data);
    c.finalize()
}

struct ChecksumWriter<'a, W: Write> {
    inner: &'a mut W,
    checksum: SimpleChecksum,
    bytes: u64,
}

impl<'a, W: Write> ChecksumWriter<'a, W> {
    fn new(inner: &'a mut W) -> Self {
        Self {
            inner,
            checksum: SimpleChecksum::new(),
            bytes: 0,
        }
    }

    fn finish(self) -> (u64, u32) {
        (self.bytes, self.checksum.finalize())
    }
}

impl<'a, W: Write> Write for ChecksumWriter<'a, W> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.checksum.update(&buf[..n]);
        self.bytes += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.inner.flush()
    }
}

fn header(state: u32, data_len: u64, checksum: u32) -> [u8; HEADER_SIZE] {
    let mut h = [0u8; HEADER_SIZE];
    h[0..4].copy_from_slice(&MAGIC.to_le_bytes());
    h[4..8].copy_from_slice(&VERSION_CURRENT.to_le_bytes());
    h[8..12].copy_from_slice(&state.to_le_bytes());
    h[12..20].copy_from_slice(&data_len.to_le_bytes());
    h[20..24].copy_from_slice(&checksum.to_le_bytes());
    h
}

impl SnapshotStore {
    pub(crate) fn new(path: PathBuf) -> Self {
        Self { path }
    }

    pub(crate) fn path(&self) -> &Path {
        &self.path
    }

    /// 加载快照；文件缺失或任何校验失败都返回 None（由提交日志兜底回放）
    pub(crate) fn load_if_valid<T: DeserializeOwned>(&self) -> anyhow::Result<Option<T>> {
        if !self.path.exists() {
            return Ok(None);
        }

        let data = std::fs::read(&self.path)?;
        if data.len() < HEADER_SIZE {
            tracing::warn!("Snapshot too small, ignoring");
            return Ok(None);
        }

        let magic = u32::from_le_bytes(data[0..4].try_into()?);
        let version = u32::from_le_bytes(data[4..8].try_into()?);
        let state = u32::from_le_bytes(data[8..12].try_into()?);
        let data_len = u64::from_le_bytes(data[12..20].try_into()?) as usize;
        let stored_checksum = u32::from_le_bytes(data[20..24].try_into()?);

        if magic != MAGIC {
            tracing::warn!("Snapshot magic mismatch: {:#x} != {:#x}", magic, MAGIC);
            return Ok(None);
        }
        if version != VERSION_CURRENT {
            tracing::warn!("Snapshot version {} unsupported", version);
            return Ok(None);
        }
        if state != STATE_COMMITTED {
            tracing::warn!("Snapshot state INCOMPLETE, ignoring");
            return Ok(None);
        }

        let body = &data[HEADER_SIZE..];
        if body.len() != data_len {
            tracing::warn!("Snapshot data length mismatch");
            return Ok(None);
        }
        let computed = checksum(body);
        if computed != stored_checksum {
            tracing::warn!(
                "Snapshot checksum mismatch: {} != {}",
                computed,
                stored_checksum
            );
            return Ok(None);
        }

        match bincode::deserialize::<T>(body) {
            Ok(v) => Ok(Some(v)),
            Err(e) => {
                tracing::warn!("Snapshot deserialize failed: {}", e);
                Ok(None)
            }
        }
    }

    /// 原子写入快照
    pub(crate) fn write_atomic<T: Serialize>(&self, value: &T) -> anyhow::Result<u64> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let tmp_path = self.path.with_extension("snap.tmp");

        let mut file = std::fs::File::create(&tmp_path)?;
        file.write_all(&header(STATE_INCOMPLETE, 0, 0))?;

        let (data_len, sum) = {
            let mut cw = ChecksumWriter::new(&mut file);
            bincode::serialize_into(&mut cw, value)?;
            cw.finish()
        };

        file.seek(SeekFrom::Start(0))?;
        file.write_all(&header(STATE_COMMITTED, data_len, sum))?;
        file.sync_all()?;

        std::fs::rename(&tmp_path, &self.path)?;

        if let Some(parent) = self.path.parent() {
            if let Ok(dir) = std::fs::File::open(parent) {
                let _ = dir.sync_all();
            }
        }

        let total = HEADER_SIZE as u64 + data_len;
        tracing::debug!("Snapshot written: {} bytes to {:?}", total, self.path);
        Ok(total)
    }
}
