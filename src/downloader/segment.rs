use crate::error::{EngineError, EngineResult};
use serde::{Deserialize, Serialize};
use sha1::{Digest, Sha1};
use std::ops::Range;
use tracing::{debug, info};

use super::task::TorrentMeta;

/// 分片 / 块状态
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SegmentState {
    /// 等待下载
    Pending,
    /// 正在下载（防止重复调度）
    InFlight,
    /// 已校验通过
    Verified,
    /// 尝试次数耗尽
    Failed,
}

impl SegmentState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SegmentState::Pending => "pending",
            SegmentState::InFlight => "inflight",
            SegmentState::Verified => "verified",
            SegmentState::Failed => "failed",
        }
    }

    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "pending" => Some(SegmentState::Pending),
            "inflight" => Some(SegmentState::InFlight),
            "verified" => Some(SegmentState::Verified),
            "failed" => Some(SegmentState::Failed),
            _ => None,
        }
    }
}

/// 分片信息
///
/// 普通下载的分片只有字节范围；块校验类任务的块额外带 SHA-1 哈希。
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Segment {
    /// 分片索引
    pub index: usize,
    /// 字节范围
    pub range: Range<u64>,
    /// 期望的 SHA-1（十六进制），普通分片为 None
    pub hash: Option<String>,
    /// 分片状态
    pub state: SegmentState,
    /// 本轮已尝试次数
    pub attempts: u32,
    /// 已计入进度的字节数
    pub written: u64,
}

impl Segment {
    pub fn new(index: usize, range: Range<u64>) -> Self {
        Self {
            index,
            range,
            hash: None,
            state: SegmentState::Pending,
            attempts: 0,
            written: 0,
        }
    }

    pub fn with_hash(index: usize, range: Range<u64>, hash: String) -> Self {
        Self {
            hash: Some(hash.to_ascii_lowercase()),
            ..Self::new(index, range)
        }
    }

    /// 分片大小
    pub fn size(&self) -> u64 {
        self.range.end - self.range.start
    }

    /// 校验取回的数据
    ///
    /// 普通分片校验字节数，块校验哈希。
    pub fn verify(&self, data_len: u64, data: Option<&[u8]>) -> EngineResult<()> {
        if data_len != self.size() {
            return Err(EngineError::Verification {
                index: self.index,
                reason: format!("字节数不符: 期望 {}，实际 {}", self.size(), data_len),
            });
        }
        if let (Some(expected), Some(bytes)) = (&self.hash, data) {
            let actual = sha1_hex(bytes);
            if &actual != expected {
                return Err(EngineError::Verification {
                    index: self.index,
                    reason: format!("哈希不匹配: 期望 {}，实际 {}", expected, actual),
                });
            }
        }
        Ok(())
    }
}

/// 计算 SHA-1（十六进制小写）
pub fn sha1_hex(data: &[u8]) -> String {
    hex::encode(Sha1::digest(data))
}

/// 将 `[0, total_size)` 划分为至多 `segments` 个连续、互不重叠的区间
///
/// 最后一个区间吸收余数；总大小为 0 时返回空列表，区间数不超过总字节数。
pub fn partition_ranges(total_size: u64, segments: usize) -> Vec<Range<u64>> {
    let count = (segments.max(1) as u64).min(total_size);
    if count == 0 {
        return Vec::new();
    }

    let base = total_size / count;
    (0..count)
        .map(|i| {
            let start = i * base;
            let end = if i + 1 == count { total_size } else { start + base };
            start..end
        })
        .collect()
}

/// 分片管理器
///
/// 分片数组由所属下载任务独占，按索引寻址。
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct SegmentManager {
    /// 所有分片
    segments: Vec<Segment>,
    /// 文件总大小
    total_size: u64,
}

impl SegmentManager {
    /// 为普通下载创建分片
    pub fn for_ranges(total_size: u64, segment_count: usize) -> Self {
        let segments: Vec<Segment> = partition_ranges(total_size, segment_count)
            .into_iter()
            .enumerate()
            .map(|(index, range)| Segment::new(index, range))
            .collect();
        info!(
            "创建分片管理器: 文件大小={} bytes, 分片数量={}",
            total_size,
            segments.len()
        );
        Self {
            segments,
            total_size,
        }
    }

    /// 为块校验类任务创建块
    pub fn for_pieces(meta: &TorrentMeta) -> EngineResult<Self> {
        meta.validate()?;
        let segments: Vec<Segment> = meta
            .piece_hashes
            .iter()
            .enumerate()
            .map(|(index, hash)| {
                let start = index as u64 * meta.piece_length;
                let end = (start + meta.piece_length).min(meta.total_size);
                Segment::with_hash(index, start..end, hash.clone())
            })
            .collect();
        info!(
            "创建块管理器: info_hash={}, 总大小={} bytes, 块数量={}",
            meta.info_hash,
            meta.total_size,
            segments.len()
        );
        Ok(Self {
            segments,
            total_size: meta.total_size,
        })
    }

    /// 从持久化数据恢复
    pub fn from_parts(total_size: u64, segments: Vec<Segment>) -> Self {
        Self {
            segments,
            total_size,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    /// 是否已完成分片划分（空文件也算已划分）
    pub fn is_planned(&self, total_size: u64) -> bool {
        self.total_size == total_size && (total_size == 0 || !self.segments.is_empty())
    }

    pub fn total_size(&self) -> u64 {
        self.total_size
    }

    /// 获取所有分片
    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    pub fn get(&self, index: usize) -> Option<&Segment> {
        self.segments.get(index)
    }

    /// 获取分片数量
    pub fn segment_count(&self) -> usize {
        self.segments.len()
    }

    /// 获取已校验的分片数量
    pub fn verified_count(&self) -> usize {
        self.count(SegmentState::Verified)
    }

    pub fn in_flight_count(&self) -> usize {
        self.count(SegmentState::InFlight)
    }

    fn count(&self, state: SegmentState) -> usize {
        self.segments.iter().filter(|s| s.state == state).count()
    }

    /// 已计入进度的字节数
    pub fn downloaded_bytes(&self) -> u64 {
        self.segments.iter().map(|s| s.written).sum()
    }

    /// 已校验分片的字节数
    pub fn verified_bytes(&self) -> u64 {
        self.segments
            .iter()
            .filter(|s| s.state == SegmentState::Verified)
            .map(|s| s.size())
            .sum()
    }

    /// 是否全部校验通过
    pub fn is_complete(&self) -> bool {
        self.segments
            .iter()
            .all(|s| s.state == SegmentState::Verified)
    }

    /// 取出下一个待下载分片并立即标记为 InFlight
    pub fn claim_next(&mut self) -> Option<Segment> {
        let segment = self
            .segments
            .iter_mut()
            .find(|s| s.state == SegmentState::Pending)?;
        segment.state = SegmentState::InFlight;
        segment.attempts += 1;
        segment.written = 0;
        Some(segment.clone())
    }

    /// 累加分片进度（仅 InFlight 的普通分片）
    pub fn add_written(&mut self, index: usize, bytes: u64) {
        if let Some(segment) = self.segments.get_mut(index) {
            if segment.state == SegmentState::InFlight {
                segment.written = (segment.written + bytes).min(segment.size());
            }
        }
    }

    /// 标记分片校验通过
    pub fn mark_verified(&mut self, index: usize) {
        if let Some(segment) = self.segments.get_mut(index) {
            segment.state = SegmentState::Verified;
            segment.written = segment.size();
            segment.attempts = 0;
        }
    }

    /// 丢弃本次尝试的数据
    ///
    /// 尝试次数未耗尽时重新排队并返回 true；耗尽时标记 Failed 并返回 false。
    pub fn release_attempt(&mut self, index: usize, max_attempts: u32) -> bool {
        let Some(segment) = self.segments.get_mut(index) else {
            return false;
        };
        segment.written = 0;
        if segment.attempts >= max_attempts {
            segment.state = SegmentState::Failed;
            debug!("分片 #{} 尝试次数耗尽 ({})", index, segment.attempts);
            false
        } else {
            segment.state = SegmentState::Pending;
            true
        }
    }

    /// 归还未完成的分片（取消 / 暂停时调用），不计入尝试次数
    pub fn return_unfinished(&mut self, index: usize) {
        if let Some(segment) = self.segments.get_mut(index) {
            if segment.state == SegmentState::InFlight {
                segment.state = SegmentState::Pending;
                segment.written = 0;
                segment.attempts = segment.attempts.saturating_sub(1);
            }
        }
    }

    /// 将所有未校验分片重置为 Pending，已校验的保留
    pub fn reset_unverified(&mut self) {
        for segment in &mut self.segments {
            if segment.state != SegmentState::Verified {
                segment.state = SegmentState::Pending;
                segment.written = 0;
            }
            segment.attempts = 0;
        }
    }

    /// 将指定分片重置为 Pending
    pub fn reset_indices(&mut self, indices: &[usize]) {
        for &index in indices {
            if let Some(segment) = self.segments.get_mut(index) {
                segment.state = SegmentState::Pending;
                segment.written = 0;
                segment.attempts = 0;
            }
        }
    }

    /// 重置所有分片状态
    pub fn reset(&mut self) {
        let all: Vec<usize> = (0..self.segments.len()).collect();
        self.reset_indices(&all);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_partition_four_equal_segments() {
        let ranges = partition_ranges(1000, 4);
        assert_eq!(ranges, vec![0..250, 250..500, 500..750, 750..1000]);
    }

    #[test]
    fn test_partition_last_absorbs_remainder() {
        let ranges = partition_ranges(1003, 4);
        assert_eq!(ranges, vec![0..250, 250..500, 500..750, 750..1003]);
    }

    #[test]
    fn test_partition_small_and_empty() {
        assert!(partition_ranges(0, 8).is_empty());
        assert_eq!(partition_ranges(3, 8), vec![0..1, 1..2, 2..3]);
        assert_eq!(partition_ranges(10, 0), vec![0..10]);
    }

    proptest! {
        #[test]
        fn prop_partition_covers_exactly_once(total in 0u64..5_000_000, n in 1usize..64) {
            let ranges = partition_ranges(total, n);
            let mut cursor = 0u64;
            for range in &ranges {
                prop_assert_eq!(range.start, cursor);
                prop_assert!(range.end > range.start);
                cursor = range.end;
            }
            prop_assert_eq!(cursor, total);
            prop_assert!(ranges.len() <= n);
        }
    }

    #[test]
    fn test_claim_and_verify() {
        let mut manager = SegmentManager::for_ranges(1000, 4);
        assert_eq!(manager.segment_count(), 4);

        let first = manager.claim_next().unwrap();
        assert_eq!(first.index, 0);
        assert_eq!(first.attempts, 1);

        // 已 InFlight 的分片不会被再次调度
        let second = manager.claim_next().unwrap();
        assert_eq!(second.index, 1);
        assert_eq!(manager.in_flight_count(), 2);

        manager.add_written(0, 100);
        assert_eq!(manager.downloaded_bytes(), 100);

        manager.mark_verified(0);
        assert_eq!(manager.downloaded_bytes(), 250);
        assert_eq!(manager.verified_count(), 1);
        assert!(!manager.is_complete());
    }

    #[test]
    fn test_release_attempt_exhausts_budget() {
        let mut manager = SegmentManager::for_ranges(100, 1);

        manager.claim_next().unwrap();
        manager.add_written(0, 40);
        assert!(manager.release_attempt(0, 2));
        assert_eq!(manager.downloaded_bytes(), 0);
        assert_eq!(manager.get(0).unwrap().state, SegmentState::Pending);

        manager.claim_next().unwrap();
        assert!(!manager.release_attempt(0, 2));
        assert_eq!(manager.get(0).unwrap().state, SegmentState::Failed);
        assert!(manager.claim_next().is_none());
    }

    #[test]
    fn test_reset_unverified_keeps_verified() {
        let mut manager = SegmentManager::for_ranges(300, 3);
        manager.claim_next();
        manager.mark_verified(0);
        manager.claim_next();
        manager.release_attempt(1, 1);

        manager.reset_unverified();
        assert_eq!(manager.get(0).unwrap().state, SegmentState::Verified);
        assert_eq!(manager.get(1).unwrap().state, SegmentState::Pending);
        assert_eq!(manager.downloaded_bytes(), 100);
    }

    #[test]
    fn test_piece_verification() {
        let data = b"hello pieces";
        let segment = Segment::with_hash(0, 0..data.len() as u64, sha1_hex(data));
        assert!(segment.verify(data.len() as u64, Some(data)).is_ok());

        let corrupted = b"hellO pieces";
        let err = segment.verify(corrupted.len() as u64, Some(corrupted)).unwrap_err();
        assert!(matches!(err, EngineError::Verification { index: 0, .. }));

        assert!(segment.verify(3, Some(b"abc")).is_err());
    }
}
