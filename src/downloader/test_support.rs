//! 测试用的内存数据来源

use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use parking_lot::Mutex;
use std::collections::{HashSet, VecDeque};
use std::ops::Range;
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use super::segment::{sha1_hex, Segment};
use super::source::{ByteStream, SegmentSource};
use super::task::{SourceDescriptor, TorrentMeta};
use crate::error::{EngineError, EngineResult};

/// 内存数据来源，可注入传输失败和损坏的块
pub struct MockSource {
    data: Vec<u8>,
    chunk_size: usize,
    /// 剩余需要失败的请求数
    failures_left: AtomicU32,
    /// 是否所有请求都失败
    always_fail: bool,
    /// 首次请求时返回损坏数据的分片
    corrupt_once: Mutex<HashSet<usize>>,
    /// 每个数据块之间的延迟
    chunk_delay: Option<Duration>,
    /// 探测返回值
    probe_size: Option<u64>,
    pub fetches: AtomicUsize,
    pub uploads: Mutex<VecDeque<Range<u64>>>,
    pub uploaded: AtomicU64,
}

impl MockSource {
    pub fn new(data: Vec<u8>) -> Self {
        let probe_size = Some(data.len() as u64);
        Self {
            data,
            chunk_size: 64,
            failures_left: AtomicU32::new(0),
            always_fail: false,
            corrupt_once: Mutex::new(HashSet::new()),
            chunk_delay: None,
            probe_size,
            fetches: AtomicUsize::new(0),
            uploads: Mutex::new(VecDeque::new()),
            uploaded: AtomicU64::new(0),
        }
    }

    pub fn failing_first(self, n: u32) -> Self {
        self.failures_left.store(n, Ordering::SeqCst);
        self
    }

    pub fn always_failing(mut self) -> Self {
        self.always_fail = true;
        self
    }

    pub fn corrupt_once(self, index: usize) -> Self {
        self.corrupt_once.lock().insert(index);
        self
    }

    pub fn with_chunk_delay(mut self, delay: Duration) -> Self {
        self.chunk_delay = Some(delay);
        self
    }

    pub fn with_probe_size(mut self, size: Option<u64>) -> Self {
        self.probe_size = size;
        self
    }

    pub fn fetch_count(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SegmentSource for MockSource {
    async fn probe(&self, _source: &SourceDescriptor) -> EngineResult<Option<u64>> {
        Ok(self.probe_size)
    }

    async fn fetch(&self, _source: &SourceDescriptor, segment: &Segment) -> EngineResult<ByteStream> {
        self.fetches.fetch_add(1, Ordering::SeqCst);

        if self.always_fail {
            return Err(EngineError::Transport("模拟网络错误".to_string()));
        }
        let failed = self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failed {
            return Err(EngineError::Transport("模拟网络错误".to_string()));
        }

        let mut bytes = self.data[segment.range.start as usize..segment.range.end as usize].to_vec();
        if self.corrupt_once.lock().remove(&segment.index) {
            if let Some(first) = bytes.first_mut() {
                *first ^= 0xff;
            }
        }

        let chunks: Vec<EngineResult<Bytes>> = bytes
            .chunks(self.chunk_size)
            .map(|c| Ok(Bytes::copy_from_slice(c)))
            .collect();
        let delay = self.chunk_delay;
        Ok(futures::stream::iter(chunks)
            .then(move |chunk| async move {
                if let Some(delay) = delay {
                    tokio::time::sleep(delay).await;
                }
                chunk
            })
            .boxed())
    }

    async fn next_upload_request(
        &self,
        _source: &SourceDescriptor,
    ) -> EngineResult<Option<Range<u64>>> {
        Ok(self.uploads.lock().pop_front())
    }

    async fn send_upload(
        &self,
        _source: &SourceDescriptor,
        _range: Range<u64>,
        data: Bytes,
    ) -> EngineResult<()> {
        self.uploaded.fetch_add(data.len() as u64, Ordering::SeqCst);
        Ok(())
    }
}

/// 测试数据
pub fn sample_bytes(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

/// 按数据生成块校验元数据
pub fn torrent_meta(data: &[u8], piece_length: u64) -> TorrentMeta {
    let piece_hashes: Vec<String> = data.chunks(piece_length as usize).map(sha1_hex).collect();
    TorrentMeta {
        info_hash: sha1_hex(data),
        piece_length,
        num_pieces: piece_hashes.len(),
        piece_hashes,
        files: vec![],
        total_size: data.len() as u64,
    }
}
