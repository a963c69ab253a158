//! 下载数据落盘
//!
//! 下载任务的字节空间 `[0, total_size)` 映射到一个或多个文件，
//! 分片按偏移量直接写入目标位置。

use crate::error::{EngineError, EngineResult};
use sha2::{Digest, Sha256};
use std::ops::Range;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs::{self, File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt, SeekFrom};
use tracing::{debug, warn};

use super::task::{Download, SourceDescriptor};

const READ_BUFFER_SIZE: usize = 256 * 1024;

/// 文件在任务字节空间中的位置
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileSpan {
    pub path: PathBuf,
    pub offset: u64,
    pub length: u64,
}

impl FileSpan {
    fn end(&self) -> u64 {
        self.offset + self.length
    }
}

/// 存储布局
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageLayout {
    spans: Vec<FileSpan>,
    total_size: u64,
}

impl StorageLayout {
    /// 单文件布局
    pub fn single(path: PathBuf, total_size: u64) -> Self {
        Self {
            spans: vec![FileSpan {
                path,
                offset: 0,
                length: total_size,
            }],
            total_size,
        }
    }

    /// 根据下载任务推导布局
    pub fn for_download(download: &Download, total_size: u64) -> Self {
        match &download.source {
            SourceDescriptor::Torrent(meta) if !meta.files.is_empty() => {
                let mut offset = 0;
                let spans = meta
                    .files
                    .iter()
                    .map(|file| {
                        let span = FileSpan {
                            path: download.save_path.join(&file.path),
                            offset,
                            length: file.length,
                        };
                        offset += file.length;
                        span
                    })
                    .collect();
                Self { spans, total_size }
            }
            _ => Self::single(download.save_path.clone(), total_size),
        }
    }

    pub fn spans(&self) -> &[FileSpan] {
        &self.spans
    }

    pub fn total_size(&self) -> u64 {
        self.total_size
    }

    fn span_index(&self, position: u64) -> Option<usize> {
        self.spans
            .iter()
            .position(|s| s.length > 0 && position >= s.offset && position < s.end())
    }

    /// 预先创建并扩展目标文件
    pub async fn preallocate(&self) -> EngineResult<()> {
        for span in &self.spans {
            if let Some(parent) = span.path.parent() {
                if !parent.as_os_str().is_empty() {
                    fs::create_dir_all(parent)
                        .await
                        .map_err(|e| EngineError::storage("创建目录失败", e))?;
                }
            }

            let file = OpenOptions::new()
                .create(true)
                .write(true)
                .truncate(false)
                .open(&span.path)
                .await
                .map_err(|e| EngineError::storage("创建文件失败", e))?;

            let current = file
                .metadata()
                .await
                .map_err(|e| EngineError::storage("读取文件信息失败", e))?
                .len();
            if current != span.length {
                file.set_len(span.length)
                    .await
                    .map_err(|e| EngineError::storage("预分配文件失败", e))?;
            }
            debug!("预分配文件: {:?}, 大小={} bytes", span.path, span.length);
        }
        Ok(())
    }

    /// 从 `offset` 开始顺序写入的写入器
    pub fn writer(self: &Arc<Self>, offset: u64) -> SegmentWriter {
        SegmentWriter {
            layout: self.clone(),
            position: offset,
            current: None,
        }
    }

    /// 一次性写入整段数据
    pub async fn write_at(self: &Arc<Self>, offset: u64, data: &[u8]) -> EngineResult<()> {
        let mut writer = self.writer(offset);
        writer.write(data).await?;
        writer.finish().await
    }

    /// 读取一段数据（用于重新校验）
    pub async fn read_range(&self, range: Range<u64>) -> EngineResult<Vec<u8>> {
        let mut out = Vec::with_capacity((range.end - range.start) as usize);
        let mut position = range.start;
        while position < range.end {
            let index = self
                .span_index(position)
                .ok_or_else(|| EngineError::Storage(format!("读取越界: {}", position)))?;
            let span = &self.spans[index];
            let len = (span.end().min(range.end) - position) as usize;

            let mut file = File::open(&span.path)
                .await
                .map_err(|e| EngineError::storage("打开文件失败", e))?;
            file.seek(SeekFrom::Start(position - span.offset))
                .await
                .map_err(|e| EngineError::storage("文件定位失败", e))?;
            let start = out.len();
            out.resize(start + len, 0);
            file.read_exact(&mut out[start..])
                .await
                .map_err(|e| EngineError::storage("读取文件失败", e))?;
            position += len as u64;
        }
        Ok(out)
    }

    /// 计算整个字节空间的 SHA-256
    pub async fn sha256_hex(&self) -> EngineResult<String> {
        let mut hasher = Sha256::new();
        let mut buffer = vec![0u8; READ_BUFFER_SIZE];
        for span in self.spans.iter().filter(|s| s.length > 0) {
            let mut file = File::open(&span.path)
                .await
                .map_err(|e| EngineError::storage("打开文件失败", e))?;
            let mut left = span.length;
            while left > 0 {
                let want = (left as usize).min(buffer.len());
                let n = file
                    .read(&mut buffer[..want])
                    .await
                    .map_err(|e| EngineError::storage("读取文件失败", e))?;
                if n == 0 {
                    return Err(EngineError::Storage(format!(
                        "文件长度不足: {:?}",
                        span.path
                    )));
                }
                hasher.update(&buffer[..n]);
                left -= n as u64;
            }
        }
        Ok(hex::encode(hasher.finalize()))
    }

    /// 删除已下载的文件（忽略不存在的文件）
    pub async fn remove_files(&self) {
        for span in &self.spans {
            if let Err(e) = fs::remove_file(&span.path).await {
                if e.kind() != std::io::ErrorKind::NotFound {
                    warn!("删除文件失败: {:?}, 错误: {}", span.path, e);
                }
            }
        }
    }
}

/// 顺序写入器，写入可能跨越多个文件
pub struct SegmentWriter {
    layout: Arc<StorageLayout>,
    position: u64,
    current: Option<(usize, File)>,
}

impl SegmentWriter {
    pub fn position(&self) -> u64 {
        self.position
    }

    pub async fn write(&mut self, mut data: &[u8]) -> EngineResult<()> {
        while !data.is_empty() {
            let index = self
                .layout
                .span_index(self.position)
                .ok_or_else(|| EngineError::Storage(format!("写入越界: {}", self.position)))?;

            if !matches!(&self.current, Some((open, _)) if *open == index) {
                self.flush_current().await?;
                let span = &self.layout.spans[index];
                let file = open_at(&span.path, self.position - span.offset).await?;
                self.current = Some((index, file));
            }

            let room = self.layout.spans[index].end() - self.position;
            let n = (room as usize).min(data.len());
            if let Some((_, file)) = self.current.as_mut() {
                file.write_all(&data[..n])
                    .await
                    .map_err(|e| EngineError::storage("写入文件失败", e))?;
            }
            self.position += n as u64;
            data = &data[n..];
        }
        Ok(())
    }

    /// 刷新文件缓冲
    pub async fn finish(mut self) -> EngineResult<()> {
        self.flush_current().await
    }

    async fn flush_current(&mut self) -> EngineResult<()> {
        if let Some((_, mut file)) = self.current.take() {
            file.flush()
                .await
                .map_err(|e| EngineError::storage("刷新文件缓冲失败", e))?;
        }
        Ok(())
    }
}

async fn open_at(path: &Path, offset: u64) -> EngineResult<File> {
    let mut file = OpenOptions::new()
        .write(true)
        .open(path)
        .await
        .map_err(|e| EngineError::storage("打开输出文件失败", e))?;
    file.seek(SeekFrom::Start(offset))
        .await
        .map_err(|e| EngineError::storage("文件定位失败", e))?;
    Ok(file)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::downloader::task::{TorrentFile, TorrentMeta};
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_preallocate_and_write_at_offset() {
        let dir = TempDir::new().unwrap();
        let layout = Arc::new(StorageLayout::single(dir.path().join("out.bin"), 10));
        layout.preallocate().await.unwrap();

        layout.write_at(5, b"world").await.unwrap();
        layout.write_at(0, b"hello").await.unwrap();

        let content = tokio::fs::read(dir.path().join("out.bin")).await.unwrap();
        assert_eq!(content, b"helloworld");
        assert_eq!(layout.read_range(3..7).await.unwrap(), b"lowo");
    }

    #[tokio::test]
    async fn test_write_across_files() {
        let dir = TempDir::new().unwrap();
        let meta = TorrentMeta {
            info_hash: "ih".to_string(),
            piece_length: 4,
            num_pieces: 2,
            piece_hashes: vec!["a".into(), "b".into()],
            files: vec![
                TorrentFile {
                    path: PathBuf::from("a.txt"),
                    length: 3,
                },
                TorrentFile {
                    path: PathBuf::from("sub/b.txt"),
                    length: 5,
                },
            ],
            total_size: 8,
        };
        let download = Download::new(
            SourceDescriptor::Torrent(meta),
            dir.path().join("payload"),
            3,
        );
        let layout = Arc::new(StorageLayout::for_download(&download, 8));
        assert_eq!(layout.spans().len(), 2);
        layout.preallocate().await.unwrap();

        layout.write_at(0, b"abcdefgh").await.unwrap();

        let a = tokio::fs::read(dir.path().join("payload/a.txt")).await.unwrap();
        let b = tokio::fs::read(dir.path().join("payload/sub/b.txt")).await.unwrap();
        assert_eq!(a, b"abc");
        assert_eq!(b, b"defgh");
        assert_eq!(layout.read_range(2..6).await.unwrap(), b"cdef");
    }

    #[tokio::test]
    async fn test_write_out_of_bounds_is_storage_error() {
        let dir = TempDir::new().unwrap();
        let layout = Arc::new(StorageLayout::single(dir.path().join("x.bin"), 4));
        layout.preallocate().await.unwrap();
        let err = layout.write_at(2, b"toolong").await.unwrap_err();
        assert!(matches!(err, EngineError::Storage(_)));
    }

    #[tokio::test]
    async fn test_sha256_of_file() {
        let dir = TempDir::new().unwrap();
        let layout = Arc::new(StorageLayout::single(dir.path().join("h.bin"), 3));
        layout.preallocate().await.unwrap();
        layout.write_at(0, b"abc").await.unwrap();
        assert_eq!(
            layout.sha256_hex().await.unwrap(),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }
}
