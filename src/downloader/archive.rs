//! 流式 ZIP 打包
//!
//! 条目使用 deflate 压缩，本地文件头不写大小（置位第 3 位，数据后跟数据描述符），
//! 所以整个压缩包可以顺序写入不可回溯的输出流。中央目录只在 [`ArchiveWriter::finish`] 时写入。
//!
//! 检查点会对压缩器做同步刷新，使已写出的字节恰好对应已读取的源数据；恢复时在同一条目内
//! 接着追加新压缩器的输出，解压端看到的仍然是一个连续的 deflate 流。

use std::collections::HashSet;
use std::io::Write;
use std::path::Path;
use std::time::SystemTime;

use chrono::{DateTime, Datelike, Local, Timelike};
use flate2::Compression;
use flate2::write::DeflateEncoder;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tracing::debug;

use super::error::{DownloadError, Result};

const LOCAL_HEADER_SIG: u32 = 0x0403_4b50;
const DATA_DESCRIPTOR_SIG: u32 = 0x0807_4b50;
const CENTRAL_HEADER_SIG: u32 = 0x0201_4b50;
const END_OF_CENTRAL_DIR_SIG: u32 = 0x0605_4b50;

const VERSION_NEEDED: u16 = 20;
const VERSION_MADE_BY: u16 = 0x0314; // unix, 2.0
const FLAGS: u16 = 0x0808; // 数据描述符 + UTF-8 文件名
const METHOD_DEFLATE: u16 = 8;
const UNIX_FILE_MODE: u32 = 0o100644 << 16;

const MAX_ENTRIES: usize = u16::MAX as usize;
const MAX_OFFSET: u64 = u32::MAX as u64;

/// 一个条目在压缩包中的记录
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct EntryRecord {
    pub name: String,
    /// 对应 filePaths 中的下标
    pub source_index: usize,
    pub header_offset: u64,
    pub crc32: u32,
    pub compressed_size: u64,
    pub uncompressed_size: u64,
    pub dos_time: u16,
    pub dos_date: u16,
}

/// 压缩包写入位置，随断点一起持久化
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ArchiveCursor {
    pub bytes_written: u64,
    pub entries: Vec<EntryRecord>,
    pub open_entry: Option<EntryRecord>,
}

struct OpenEntry {
    record: EntryRecord,
    hasher: crc32fast::Hasher,
    encoder: DeflateEncoder<Vec<u8>>,
}

pub struct ArchiveWriter<W> {
    sink: W,
    level: Compression,
    bytes_written: u64,
    entries: Vec<EntryRecord>,
    open: Option<OpenEntry>,
}

impl<W: AsyncWrite + Unpin> ArchiveWriter<W> {
    pub fn new(sink: W, level: u32) -> Self {
        Self {
            sink,
            level: Compression::new(level.min(9)),
            bytes_written: 0,
            entries: Vec::new(),
            open: None,
        }
    }

    /// 从检查点继续写。调用方需保证 sink 中已有且只有 cursor.bytes_written 个字节。
    pub fn resume(sink: W, level: u32, cursor: ArchiveCursor) -> Self {
        let mut writer = Self::new(sink, level);
        writer.bytes_written = cursor.bytes_written;
        writer.entries = cursor.entries;
        writer.open = cursor.open_entry.map(|record| OpenEntry {
            hasher: crc32fast::Hasher::new_with_initial_len(record.crc32, record.uncompressed_size),
            encoder: DeflateEncoder::new(Vec::new(), writer.level),
            record,
        });
        debug!(
            "压缩包从 {} 字节处继续写入，已完成 {} 个条目",
            writer.bytes_written,
            writer.entries.len()
        );
        writer
    }

    pub fn bytes_written(&self) -> u64 {
        self.bytes_written
    }

    pub fn entry_count(&self) -> usize {
        self.entries.len()
    }

    /// 当前未关闭条目对应的源文件下标
    pub fn open_source_index(&self) -> Option<usize> {
        self.open.as_ref().map(|open| open.record.source_index)
    }

    pub async fn start_entry(
        &mut self,
        name: &str,
        source_index: usize,
        modified: SystemTime,
    ) -> Result<()> {
        if self.open.is_some() {
            return Err(DownloadError::InvalidState("上一个条目尚未关闭".into()));
        }
        if self.entries.len() >= MAX_ENTRIES {
            return Err(DownloadError::ArchiveLimit(format!(
                "条目数超过 {MAX_ENTRIES}"
            )));
        }
        if self.bytes_written > MAX_OFFSET {
            return Err(DownloadError::ArchiveLimit("压缩包超过 4GiB".into()));
        }

        let (dos_time, dos_date) = dos_datetime(modified);
        let record = EntryRecord {
            name: name.to_string(),
            source_index,
            header_offset: self.bytes_written,
            crc32: 0,
            compressed_size: 0,
            uncompressed_size: 0,
            dos_time,
            dos_date,
        };

        let name_bytes = name.as_bytes();
        let mut header = Vec::with_capacity(30 + name_bytes.len());
        put_u32(&mut header, LOCAL_HEADER_SIG);
        put_u16(&mut header, VERSION_NEEDED);
        put_u16(&mut header, FLAGS);
        put_u16(&mut header, METHOD_DEFLATE);
        put_u16(&mut header, dos_time);
        put_u16(&mut header, dos_date);
        put_u32(&mut header, 0); // crc32，见数据描述符
        put_u32(&mut header, 0);
        put_u32(&mut header, 0);
        put_u16(&mut header, name_bytes.len() as u16);
        put_u16(&mut header, 0);
        header.extend_from_slice(name_bytes);
        self.emit(&header).await?;

        self.open = Some(OpenEntry {
            record,
            hasher: crc32fast::Hasher::new(),
            encoder: DeflateEncoder::new(Vec::new(), self.level),
        });
        Ok(())
    }

    pub async fn write_data(&mut self, data: &[u8]) -> Result<()> {
        let Some(open) = self.open.as_mut() else {
            return Err(DownloadError::InvalidState("没有打开的条目".into()));
        };
        if open.record.uncompressed_size + data.len() as u64 > MAX_OFFSET {
            return Err(DownloadError::ArchiveLimit(format!(
                "文件 {} 超过 4GiB",
                open.record.name
            )));
        }
        open.hasher.update(data);
        open.record.uncompressed_size += data.len() as u64;
        open.encoder.write_all(data)?;
        let compressed = std::mem::take(open.encoder.get_mut());
        open.record.compressed_size += compressed.len() as u64;
        self.emit(&compressed).await
    }

    /// 同步刷新压缩器与输出流，返回可持久化的写入位置
    pub async fn checkpoint(&mut self) -> Result<ArchiveCursor> {
        if let Some(open) = self.open.as_mut() {
            open.encoder.flush()?;
            let compressed = std::mem::take(open.encoder.get_mut());
            open.record.compressed_size += compressed.len() as u64;
            self.emit(&compressed).await?;
        }
        self.sink.flush().await?;

        let open_entry = self.open.as_ref().map(|open| EntryRecord {
            crc32: open.hasher.clone().finalize(),
            ..open.record.clone()
        });
        Ok(ArchiveCursor {
            bytes_written: self.bytes_written,
            entries: self.entries.clone(),
            open_entry,
        })
    }

    /// 结束当前条目并写入数据描述符
    pub async fn finish_entry(&mut self) -> Result<()> {
        let record = self.close_open_entry().await?;
        debug!(
            "条目完成：{}（{} -> {} 字节）",
            record.name, record.uncompressed_size, record.compressed_size
        );
        self.entries.push(record);
        Ok(())
    }

    /// 放弃当前条目：数据保留在流中，但不会出现在中央目录里
    pub async fn abandon_entry(&mut self) -> Result<()> {
        if self.open.is_some() {
            let record = self.close_open_entry().await?;
            debug!("条目已放弃：{}", record.name);
        }
        Ok(())
    }

    /// 写入中央目录和目录结束记录，返回输出流和压缩包总大小
    pub async fn finish(mut self) -> Result<(W, u64)> {
        if self.open.is_some() {
            self.finish_entry().await?;
        }

        let central_offset = self.bytes_written;
        if central_offset > MAX_OFFSET {
            return Err(DownloadError::ArchiveLimit("压缩包超过 4GiB".into()));
        }

        let mut directory = Vec::new();
        for entry in &self.entries {
            let name_bytes = entry.name.as_bytes();
            put_u32(&mut directory, CENTRAL_HEADER_SIG);
            put_u16(&mut directory, VERSION_MADE_BY);
            put_u16(&mut directory, VERSION_NEEDED);
            put_u16(&mut directory, FLAGS);
            put_u16(&mut directory, METHOD_DEFLATE);
            put_u16(&mut directory, entry.dos_time);
            put_u16(&mut directory, entry.dos_date);
            put_u32(&mut directory, entry.crc32);
            put_u32(&mut directory, entry.compressed_size as u32);
            put_u32(&mut directory, entry.uncompressed_size as u32);
            put_u16(&mut directory, name_bytes.len() as u16);
            put_u16(&mut directory, 0); // extra
            put_u16(&mut directory, 0); // comment
            put_u16(&mut directory, 0); // disk number
            put_u16(&mut directory, 0); // internal attributes
            put_u32(&mut directory, UNIX_FILE_MODE);
            put_u32(&mut directory, entry.header_offset as u32);
            directory.extend_from_slice(name_bytes);
        }

        let central_size = directory.len() as u32;
        let count = self.entries.len() as u16;
        put_u32(&mut directory, END_OF_CENTRAL_DIR_SIG);
        put_u16(&mut directory, 0);
        put_u16(&mut directory, 0);
        put_u16(&mut directory, count);
        put_u16(&mut directory, count);
        put_u32(&mut directory, central_size);
        put_u32(&mut directory, central_offset as u32);
        put_u16(&mut directory, 0);

        self.emit(&directory).await?;
        self.sink.flush().await?;
        debug!(
            "压缩包写入完成：{} 个条目，共 {} 字节",
            self.entries.len(),
            self.bytes_written
        );
        Ok((self.sink, self.bytes_written))
    }

    async fn close_open_entry(&mut self) -> Result<EntryRecord> {
        let Some(mut open) = self.open.take() else {
            return Err(DownloadError::InvalidState("没有打开的条目".into()));
        };
        open.encoder.try_finish()?;
        let compressed = std::mem::take(open.encoder.get_mut());
        open.record.compressed_size += compressed.len() as u64;
        open.record.crc32 = open.hasher.finalize();
        self.emit(&compressed).await?;

        let mut descriptor = Vec::with_capacity(16);
        put_u32(&mut descriptor, DATA_DESCRIPTOR_SIG);
        put_u32(&mut descriptor, open.record.crc32);
        put_u32(&mut descriptor, open.record.compressed_size as u32);
        put_u32(&mut descriptor, open.record.uncompressed_size as u32);
        self.emit(&descriptor).await?;
        Ok(open.record)
    }

    async fn emit(&mut self, bytes: &[u8]) -> Result<()> {
        if bytes.is_empty() {
            return Ok(());
        }
        self.sink.write_all(bytes).await?;
        self.bytes_written += bytes.len() as u64;
        Ok(())
    }
}

fn put_u16(buf: &mut Vec<u8>, value: u16) {
    buf.extend_from_slice(&value.to_le_bytes());
}

fn put_u32(buf: &mut Vec<u8>, value: u32) {
    buf.extend_from_slice(&value.to_le_bytes());
}

/// MS-DOS 格式的时间与日期，年份限定在 1980-2107
pub fn dos_datetime(time: SystemTime) -> (u16, u16) {
    let local: DateTime<Local> = time.into();
    let year = local.year().clamp(1980, 2107) as u16;
    let date = ((year - 1980) << 9) | ((local.month() as u16) << 5) | local.day() as u16;
    let time = ((local.hour() as u16) << 11)
        | ((local.minute() as u16) << 5)
        | (local.second() as u16 / 2);
    (time, date)
}

/// 压缩包内的条目名：取文件名，重名时加上序号前缀
pub fn entry_names(paths: &[impl AsRef<Path>]) -> Vec<String> {
    let mut used = HashSet::new();
    paths
        .iter()
        .enumerate()
        .map(|(index, path)| {
            let base = path
                .as_ref()
                .file_name()
                .map(|name| name.to_string_lossy().into_owned())
                .unwrap_or_else(|| format!("file_{index}"));
            let mut name = base.clone();
            let mut attempt = 0;
            // 加前缀后的名字也可能与已有文件名相同
            while used.contains(&name) {
                name = match attempt {
                    0 => format!("{index}_{base}"),
                    n => format!("{index}_{n}_{base}"),
                };
                attempt += 1;
            }
            used.insert(name.clone());
            name
        })
        .collect()
}
