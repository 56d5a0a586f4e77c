//! HTTP engine
//!
//! A synchronous-feeling, single-request HTTP client: one engine owns one
//! in-flight request at a time, mirroring the one-engine-per-block rule.
//! Handles redirects, ranged requests, cancellation and retry with
//! exponential backoff. Body data is pushed through a caller-supplied
//! [`DataSink`]; consuming less than a full chunk aborts the transfer.

use crate::config::HttpConfig;
use crate::error::{DownloadError, Result, TransportErrorKind};

use async_trait::async_trait;
use futures::StreamExt;
use reqwest::{header, redirect, Client, Method, Response};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Browser-like user agent; many servers reject unadorned clients.
pub const USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 \
     (KHTML, like Gecko) Chrome/131.0.0.0 Safari/537.36";

/// Overall timeout for the HEAD/GET probe
const PROBE_TIMEOUT: Duration = Duration::from_secs(60);

/// Backoff ladder between retry attempts; clamped at the last entry.
const RETRY_BACKOFF_SECS: [u64; 3] = [1, 2, 4];

/// Metadata extracted from a probe request
#[derive(Debug, Clone, Default)]
pub struct FileInfo {
    /// Resource size in bytes, -1 when the server did not disclose it
    pub content_length: i64,
    /// Whether the server accepts Range requests
    pub accept_ranges: bool,
    pub etag: String,
    pub last_modified: String,
    pub content_type: String,
    /// Effective URL after redirects
    pub final_url: String,
    pub content_disposition: String,
}

/// Receiver for streamed body data.
#[async_trait]
pub trait DataSink: Send {
    /// Consume one chunk, returning the number of bytes accepted.
    /// Returning fewer than `chunk.len()` aborts the transfer.
    async fn write(&mut self, chunk: &[u8]) -> usize;
}

/// Single-request HTTP client with cancellation and retry.
pub struct HttpEngine {
    client: Client,
    config: HttpConfig,
    cancel: CancellationToken,
}

impl HttpEngine {
    /// Build an engine for the given per-request configuration.
    pub fn new(config: HttpConfig) -> Result<Self> {
        let mut builder = Client::builder()
            .connect_timeout(Duration::from_secs(config.connect_timeout_sec.max(1)))
            .redirect(redirect::Policy::limited(config.max_redirects))
            .danger_accept_invalid_certs(!config.verify_tls)
            .user_agent(USER_AGENT)
            .tcp_keepalive(Some(Duration::from_secs(60)));

        if config.transfer_timeout_sec > 0 {
            builder = builder.timeout(Duration::from_secs(config.transfer_timeout_sec));
        }

        let client = builder
            .build()
            .map_err(|e| DownloadError::Internal(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            client,
            config,
            cancel: CancellationToken::new(),
        })
    }

    /// Abort the in-flight request; all subsequent calls fail with
    /// `Cancelled`. Idempotent and safe from any thread.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Probe the resource: HEAD first, falling back to GET with an
    /// immediate body abort when the server rejects HEAD with 403/405.
    pub async fn fetch_info(&self, url: &str) -> Result<FileInfo> {
        match self.probe(url, false).await {
            Err(DownloadError::Http {
                http_status: status @ (403 | 405),
                ..
            }) => {
                tracing::debug!("HEAD returned {status}, falling back to GET probe");
                self.probe(url, true).await
            }
            other => other,
        }
    }

    async fn probe(&self, url: &str, use_get: bool) -> Result<FileInfo> {
        let max_attempts = self.config.max_retries + 1;
        let mut last_err = DownloadError::transport(TransportErrorKind::Other, "no attempt made");

        for attempt in 0..max_attempts {
            if attempt > 0 {
                self.backoff(attempt).await?;
            }
            if self.cancel.is_cancelled() {
                return Err(DownloadError::Cancelled);
            }

            let method = if use_get { Method::GET } else { Method::HEAD };
            let request = self.request(method, url).timeout(PROBE_TIMEOUT);

            let sent = tokio::select! {
                r = request.send() => r,
                _ = self.cancel.cancelled() => return Err(DownloadError::Cancelled),
            };

            let response = match sent {
                Ok(r) => r,
                Err(e) => {
                    if self.cancel.is_cancelled() {
                        return Err(DownloadError::Cancelled);
                    }
                    let err = DownloadError::from(e);
                    if !err.is_retryable() {
                        return Err(err);
                    }
                    tracing::debug!("probe attempt {} failed: {}", attempt + 1, err);
                    last_err = err;
                    continue;
                }
            };

            let status = response.status().as_u16();
            if status >= 400 {
                let err = DownloadError::http_status(status, format!("HTTP error {status}"));
                if !err.is_retryable() {
                    return Err(err);
                }
                tracing::debug!("probe attempt {} got status {}", attempt + 1, status);
                last_err = err;
                continue;
            }

            // Headers are in. Dropping the response aborts the body, which
            // for the GET fallback is exactly the point.
            return Ok(Self::file_info_from(&response));
        }

        Err(last_err)
    }

    /// Download `[range_start, range_end]` into the sink. `range_start < 0`
    /// sends no Range header; `range_end < 0` requests an open-ended range.
    /// `on_progress` receives the cumulative consumed byte count.
    ///
    /// A retryable mid-body failure resumes the range past the bytes the
    /// sink already consumed; positional writers stay consistent.
    pub async fn download(
        &self,
        url: &str,
        range_start: i64,
        range_end: i64,
        sink: &mut dyn DataSink,
        on_progress: Option<&(dyn Fn(i64) + Send + Sync)>,
    ) -> Result<()> {
        let max_attempts = self.config.max_retries + 1;
        let mut consumed_total: i64 = 0;
        let mut last_err = DownloadError::transport(TransportErrorKind::Other, "no attempt made");

        for attempt in 0..max_attempts {
            if self.cancel.is_cancelled() {
                return Err(DownloadError::Cancelled);
            }
            if attempt > 0 {
                self.backoff(attempt).await?;
            }

            let result = self
                .attempt_transfer(url, range_start, range_end, &mut consumed_total, sink, on_progress)
                .await;

            match result {
                Ok(()) => return Ok(()),
                Err(err) => {
                    if self.cancel.is_cancelled() {
                        return Err(DownloadError::Cancelled);
                    }
                    if !err.is_retryable() {
                        return Err(err);
                    }
                    tracing::debug!("download attempt {} failed: {}", attempt + 1, err);
                    last_err = err;
                }
            }
        }

        Err(last_err)
    }

    async fn attempt_transfer(
        &self,
        url: &str,
        range_start: i64,
        range_end: i64,
        consumed_total: &mut i64,
        sink: &mut dyn DataSink,
        on_progress: Option<&(dyn Fn(i64) + Send + Sync)>,
    ) -> Result<()> {
        // Resume past bytes already consumed by earlier attempts.
        let effective_start = if range_start >= 0 {
            range_start + *consumed_total
        } else if *consumed_total > 0 {
            *consumed_total
        } else {
            -1
        };

        if range_end >= 0 && effective_start > range_end {
            return Ok(());
        }

        let mut request = self.request(Method::GET, url);
        if effective_start >= 0 {
            request = request.header(header::RANGE, range_header(effective_start, range_end));
        }

        let sent = tokio::select! {
            r = request.send() => r,
            _ = self.cancel.cancelled() => return Err(DownloadError::Cancelled),
        };
        let response = sent.map_err(DownloadError::from)?;

        let status = response.status().as_u16();
        if status >= 400 {
            return Err(DownloadError::http_status(status, format!("HTTP error {status}")));
        }

        // Stall detection: average below low_speed_limit for low_speed_time
        // aborts the attempt with a retryable timeout.
        let low_speed_window = Duration::from_secs(self.config.low_speed_time.max(1));
        let low_speed_floor =
            self.config.low_speed_limit as u64 * self.config.low_speed_time.max(1);
        let mut window_deadline = tokio::time::Instant::now() + low_speed_window;
        let mut window_bytes: u64 = 0;

        let mut stream = response.bytes_stream();
        loop {
            let next = tokio::select! {
                c = stream.next() => c,
                _ = self.cancel.cancelled() => return Err(DownloadError::Cancelled),
                _ = tokio::time::sleep_until(window_deadline),
                        if self.config.low_speed_limit > 0 => {
                    if window_bytes < low_speed_floor {
                        return Err(DownloadError::transport(
                            TransportErrorKind::Timeout,
                            format!(
                                "transfer below {} B/s for {} s",
                                self.config.low_speed_limit, self.config.low_speed_time
                            ),
                        ));
                    }
                    window_bytes = 0;
                    window_deadline = tokio::time::Instant::now() + low_speed_window;
                    continue;
                }
            };

            let Some(chunk) = next else { break };
            let chunk = chunk.map_err(DownloadError::from)?;
            window_bytes += chunk.len() as u64;

            let used = sink.write(&chunk).await;
            *consumed_total += used as i64;
            if let Some(cb) = on_progress {
                cb(*consumed_total);
            }
            if used < chunk.len() {
                return Err(DownloadError::transport(
                    TransportErrorKind::Aborted,
                    "transfer aborted by data sink",
                ));
            }
        }

        // A clean end of body short of the requested range is a partial
        // transfer; the retry resumes from the consumed position.
        if range_start >= 0 && range_end >= 0 {
            let expected = range_end - range_start + 1;
            if *consumed_total < expected {
                return Err(DownloadError::transport(
                    TransportErrorKind::PartialTransfer,
                    format!("received {} of {} bytes", *consumed_total, expected),
                ));
            }
        }

        Ok(())
    }

    /// Sleep the backoff for `attempt` (1-based), checking cancellation
    /// before and after.
    async fn backoff(&self, attempt: u32) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(DownloadError::Cancelled);
        }
        let idx = ((attempt - 1) as usize).min(RETRY_BACKOFF_SECS.len() - 1);
        tokio::select! {
            _ = tokio::time::sleep(Duration::from_secs(RETRY_BACKOFF_SECS[idx])) => {}
            _ = self.cancel.cancelled() => {}
        }
        if self.cancel.is_cancelled() {
            return Err(DownloadError::Cancelled);
        }
        Ok(())
    }

    fn request(&self, method: Method, url: &str) -> reqwest::RequestBuilder {
        let mut request = self
            .client
            .request(method, url)
            .header(header::ACCEPT, "*/*")
            .header(header::ACCEPT_LANGUAGE, "en-US,en;q=0.9");

        if !self.config.referer.is_empty() {
            request = request.header(header::REFERER, &self.config.referer);
        }
        if !self.config.cookie.is_empty() {
            request = request.header(header::COOKIE, &self.config.cookie);
        }
        if !self.config.username.is_empty() {
            request = request.basic_auth(&self.config.username, Some(&self.config.password));
        }
        request
    }

    fn file_info_from(response: &Response) -> FileInfo {
        let headers = response.headers();
        let text = |name: &str| {
            headers
                .get(name)
                .and_then(|v| v.to_str().ok())
                .unwrap_or("")
                .trim()
                .to_string()
        };

        let content_length = headers
            .get(header::CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|s| s.trim().parse::<i64>().ok())
            .unwrap_or(-1);

        // Any Accept-Ranges value other than "none" advertises support.
        let accept_ranges = headers
            .get(header::ACCEPT_RANGES)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.trim() != "none")
            .unwrap_or(false);

        FileInfo {
            content_length,
            accept_ranges,
            etag: text("etag"),
            last_modified: text("last-modified"),
            content_type: text("content-type"),
            final_url: response.url().to_string(),
            content_disposition: text("content-disposition"),
        }
    }
}

/// Range header value: `bytes=<start>-` when `end < 0`, else
/// `bytes=<start>-<end>`.
pub(crate) fn range_header(start: i64, end: i64) -> String {
    if end >= 0 {
        format!("bytes={start}-{end}")
    } else {
        format!("bytes={start}-")
    }
}

/// Filename from a Content-Disposition header. RFC 5987
/// `filename*=UTF-8''...` takes precedence over plain `filename=`.
pub(crate) fn parse_content_disposition(header: &str) -> Option<String> {
    if let Some(pos) = header.find("filename*=") {
        let rest = &header[pos + 10..];
        if let Some(q) = rest.find("''") {
            let encoded = &rest[q + 2..];
            let end = encoded.find(';').unwrap_or(encoded.len());
            let trimmed = encoded[..end].trim().trim_end_matches('"');
            if let Ok(decoded) = urlencoding::decode(trimmed) {
                if !decoded.is_empty() {
                    return Some(decoded.into_owned());
                }
            }
        }
    }

    if let Some(pos) = header.find("filename=") {
        let rest = &header[pos + 9..];
        let name = if let Some(stripped) = rest.strip_prefix('"') {
            stripped.find('"').map(|end| stripped[..end].to_string())
        } else {
            let end = rest.find(';').unwrap_or(rest.len());
            Some(rest[..end].trim().to_string())
        };
        if let Some(name) = name.filter(|n| !n.is_empty()) {
            return Some(name);
        }
    }

    None
}

/// Last path segment of a URL, percent-decoded. Query strings are ignored.
pub(crate) fn filename_from_url(url: &str) -> Option<String> {
    let parsed = url::Url::parse(url).ok()?;
    let segment = parsed
        .path_segments()?
        .next_back()
        .filter(|s| !s.is_empty())?
        .to_string();
    let decoded = urlencoding::decode(&segment)
        .map(|d| d.into_owned())
        .unwrap_or(segment);
    (!decoded.is_empty()).then_some(decoded)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn range_header_values() {
        assert_eq!(range_header(0, -1), "bytes=0-");
        assert_eq!(range_header(100, -1), "bytes=100-");
        assert_eq!(range_header(0, 99), "bytes=0-99");
        assert_eq!(range_header(1000, 1999), "bytes=1000-1999");
    }

    #[test]
    fn content_disposition_quoted() {
        assert_eq!(
            parse_content_disposition("attachment; filename=\"test.zip\""),
            Some("test.zip".to_string())
        );
    }

    #[test]
    fn content_disposition_unquoted() {
        assert_eq!(
            parse_content_disposition("attachment; filename=test.zip"),
            Some("test.zip".to_string())
        );
        assert_eq!(
            parse_content_disposition("attachment; filename=test.zip; size=42"),
            Some("test.zip".to_string())
        );
    }

    #[test]
    fn content_disposition_rfc5987() {
        assert_eq!(
            parse_content_disposition("attachment; filename*=UTF-8''test%20file.zip"),
            Some("test file.zip".to_string())
        );
    }

    #[test]
    fn content_disposition_star_takes_precedence() {
        assert_eq!(
            parse_content_disposition(
                "attachment; filename=\"fallback.bin\"; filename*=UTF-8''%E6%96%87%E4%BB%B6.zip"
            ),
            Some("文件.zip".to_string())
        );
    }

    #[test]
    fn content_disposition_absent() {
        assert_eq!(parse_content_disposition(""), None);
        assert_eq!(parse_content_disposition("inline"), None);
    }

    #[test]
    fn filename_from_url_basics() {
        assert_eq!(
            filename_from_url("https://example.com/path/to/file.zip"),
            Some("file.zip".to_string())
        );
        assert_eq!(
            filename_from_url("https://example.com/path/file%20name.zip"),
            Some("file name.zip".to_string())
        );
    }

    #[test]
    fn filename_from_url_ignores_query() {
        assert_eq!(
            filename_from_url("https://example.com/dl/file.iso?token=abc&x=1"),
            Some("file.iso".to_string())
        );
    }

    #[test]
    fn filename_from_url_empty_path() {
        assert_eq!(filename_from_url("https://example.com/"), None);
        assert_eq!(filename_from_url("https://example.com"), None);
        assert_eq!(filename_from_url("not a url"), None);
    }
}
