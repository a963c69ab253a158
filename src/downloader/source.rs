//! 分片数据来源
//!
//! 引擎只通过 `SegmentSource` 取数据：普通下载走 HTTP Range 请求，
//! 块校验类下载的块由调用方提供的来源取回（线路协议不在本 crate 内）。

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use futures::{StreamExt, TryStreamExt};
use reqwest::{Client, StatusCode};
use std::ops::Range;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use super::segment::Segment;
use super::task::SourceDescriptor;
use crate::error::{EngineError, EngineResult};

/// 分片数据流
pub type ByteStream = BoxStream<'static, EngineResult<Bytes>>;

/// 分片数据来源
#[async_trait]
pub trait SegmentSource: Send + Sync {
    /// 探测总大小，无法得知时返回 None
    async fn probe(&self, source: &SourceDescriptor) -> EngineResult<Option<u64>>;

    /// 取回一个分片 / 块的数据
    async fn fetch(&self, source: &SourceDescriptor, segment: &Segment) -> EngineResult<ByteStream>;

    /// 做种时对端请求的下一段数据，没有请求时返回 None
    async fn next_upload_request(
        &self,
        _source: &SourceDescriptor,
    ) -> EngineResult<Option<Range<u64>>> {
        Ok(None)
    }

    /// 把数据发给对端
    async fn send_upload(
        &self,
        _source: &SourceDescriptor,
        _range: Range<u64>,
        _data: Bytes,
    ) -> EngineResult<()> {
        Ok(())
    }
}

/// HTTP 分段来源
#[derive(Debug, Clone)]
pub struct HttpSource {
    client: Client,
    timeout: Duration,
}

impl HttpSource {
    pub fn new(timeout: Duration) -> EngineResult<Self> {
        let client = Client::builder()
            .user_agent(concat!("download-engine/", env!("CARGO_PKG_VERSION")))
            .connect_timeout(Duration::from_secs(30))
            .pool_max_idle_per_host(32)
            .pool_idle_timeout(Duration::from_secs(90))
            .tcp_keepalive(Duration::from_secs(60))
            .tcp_nodelay(true)
            .redirect(reqwest::redirect::Policy::limited(10))
            .build()
            .map_err(|e| EngineError::Transport(format!("创建 HTTP 客户端失败: {}", e)))?;
        Ok(Self { client, timeout })
    }

    fn url_of(source: &SourceDescriptor) -> EngineResult<&str> {
        match source {
            SourceDescriptor::Url { url, .. } => Ok(url),
            SourceDescriptor::Torrent(meta) => Err(EngineError::Transport(format!(
                "HTTP 来源不能下载块校验类任务: {}",
                meta.info_hash
            ))),
        }
    }
}

/// 解析 `Content-Range: bytes 0-0/1234` 中的总大小
fn parse_content_range_total(value: &str) -> Option<u64> {
    value.rsplit('/').next()?.trim().parse().ok()
}

#[async_trait]
impl SegmentSource for HttpSource {
    async fn probe(&self, source: &SourceDescriptor) -> EngineResult<Option<u64>> {
        let url = Self::url_of(source)?;
        info!("🔍 探测文件大小: {}", url);

        let response = self
            .client
            .get(url)
            .header("Range", "bytes=0-0")
            .timeout(self.timeout)
            .send()
            .await?;

        let status = response.status();
        let total = match status {
            StatusCode::PARTIAL_CONTENT => response
                .headers()
                .get(reqwest::header::CONTENT_RANGE)
                .and_then(|v| v.to_str().ok())
                .and_then(parse_content_range_total),
            StatusCode::OK => {
                warn!("⚠️ 服务器可能不支持 Range 请求: {}", url);
                response.content_length()
            }
            other => {
                return Err(EngineError::Transport(format!(
                    "探测失败: 服务器返回异常状态码 {} (期望 206 或 200)",
                    other
                )))
            }
        };

        debug!("探测结果: url={}, total_size={:?}", url, total);
        Ok(total)
    }

    async fn fetch(&self, source: &SourceDescriptor, segment: &Segment) -> EngineResult<ByteStream> {
        let url = Self::url_of(source)?;
        let range = &segment.range;

        let response = self
            .client
            .get(url)
            .header("Range", format!("bytes={}-{}", range.start, range.end - 1))
            .timeout(self.timeout)
            .send()
            .await?;

        let status = response.status();
        match status {
            StatusCode::PARTIAL_CONTENT => {}
            // 整个文件只有一个分片时服务器可以直接返回完整内容
            StatusCode::OK if range.start == 0 => {}
            StatusCode::OK => {
                return Err(EngineError::Transport(format!(
                    "服务器忽略了 Range 请求: 分片 #{}",
                    segment.index
                )))
            }
            other => return Err(EngineError::Transport(format!("HTTP错误: {}", other))),
        }

        Ok(response.bytes_stream().map_err(EngineError::from).boxed())
    }
}

/// 按下载来源类型分发到具体的数据来源
pub struct SourceRouter {
    http: Arc<dyn SegmentSource>,
    pieces: Option<Arc<dyn SegmentSource>>,
}

impl SourceRouter {
    pub fn new(http: Arc<dyn SegmentSource>) -> Self {
        Self { http, pieces: None }
    }

    /// 设置块校验类任务的来源
    pub fn with_piece_source(mut self, pieces: Arc<dyn SegmentSource>) -> Self {
        self.pieces = Some(pieces);
        self
    }

    fn route(&self, source: &SourceDescriptor) -> EngineResult<&Arc<dyn SegmentSource>> {
        match source {
            SourceDescriptor::Url { .. } => Ok(&self.http),
            SourceDescriptor::Torrent(_) => self
                .pieces
                .as_ref()
                .ok_or_else(|| EngineError::Transport("未配置块来源".to_string())),
        }
    }
}

#[async_trait]
impl SegmentSource for SourceRouter {
    async fn probe(&self, source: &SourceDescriptor) -> EngineResult<Option<u64>> {
        self.route(source)?.probe(source).await
    }

    async fn fetch(&self, source: &SourceDescriptor, segment: &Segment) -> EngineResult<ByteStream> {
        self.route(source)?.fetch(source, segment).await
    }

    async fn next_upload_request(
        &self,
        source: &SourceDescriptor,
    ) -> EngineResult<Option<Range<u64>>> {
        self.route(source)?.next_upload_request(source).await
    }

    async fn send_upload(
        &self,
        source: &SourceDescriptor,
        range: Range<u64>,
        data: Bytes,
    ) -> EngineResult<()> {
        self.route(source)?.send_upload(source, range, data).await
    }
}
