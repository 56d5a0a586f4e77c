//! HTTP engine integration tests
//!
//! Exercise the probe, the ranged streaming download and the retry policy
//! against wiremock servers.

use async_trait::async_trait;
use splitfetch::{DataSink, DownloadError, HttpConfig, HttpEngine};
use std::time::{Duration, Instant};
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, Request, Respond, ResponseTemplate};

/// Sink collecting everything into memory
struct VecSink(Vec<u8>);

#[async_trait]
impl DataSink for VecSink {
    async fn write(&mut self, chunk: &[u8]) -> usize {
        self.0.extend_from_slice(chunk);
        chunk.len()
    }
}

/// Serves a byte buffer with Range support (206 + Content-Range)
struct RangeResponder(Vec<u8>);

impl Respond for RangeResponder {
    fn respond(&self, request: &Request) -> ResponseTemplate {
        let total = self.0.len() as u64;
        let range = request
            .headers
            .get("range")
            .and_then(|v| v.to_str().ok())
            .and_then(parse_range);

        match range {
            Some((start, end)) => {
                let end = end.unwrap_or(total - 1).min(total - 1);
                let body = self.0[start as usize..=end as usize].to_vec();
                ResponseTemplate::new(206)
                    .insert_header("Content-Range", format!("bytes {start}-{end}/{total}"))
                    .set_body_bytes(body)
            }
            None => ResponseTemplate::new(200).set_body_bytes(self.0.clone()),
        }
    }
}

fn parse_range(header: &str) -> Option<(u64, Option<u64>)> {
    let value = header.strip_prefix("bytes=")?;
    let (start, end) = value.split_once('-')?;
    let start = start.parse().ok()?;
    let end = if end.is_empty() {
        None
    } else {
        Some(end.parse().ok()?)
    };
    Some((start, end))
}

fn engine_with_retries(max_retries: u32) -> HttpEngine {
    HttpEngine::new(HttpConfig {
        max_retries,
        connect_timeout_sec: 5,
        ..Default::default()
    })
    .unwrap()
}

fn test_body(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

// ── probe ──────────────────────────────────────────────────────

#[tokio::test]
async fn fetch_info_extracts_head_metadata() {
    let server = MockServer::start().await;
    Mock::given(method("HEAD"))
        .and(path("/file.bin"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("Content-Length", "12345")
                .insert_header("Accept-Ranges", "bytes")
                .insert_header("ETag", "\"v1\"")
                .insert_header("Last-Modified", "Wed, 01 Jan 2025 00:00:00 GMT")
                .insert_header("Content-Type", "application/octet-stream")
                .insert_header("Content-Disposition", "attachment; filename=\"real.bin\""),
        )
        .mount(&server)
        .await;

    let engine = engine_with_retries(0);
    let info = engine
        .fetch_info(&format!("{}/file.bin", server.uri()))
        .await
        .unwrap();

    assert_eq!(info.content_length, 12345);
    assert!(info.accept_ranges);
    assert_eq!(info.etag, "\"v1\"");
    assert_eq!(info.last_modified, "Wed, 01 Jan 2025 00:00:00 GMT");
    assert_eq!(info.content_type, "application/octet-stream");
    assert_eq!(info.content_disposition, "attachment; filename=\"real.bin\"");
    assert!(info.final_url.ends_with("/file.bin"));
}

#[tokio::test]
async fn accept_ranges_none_means_unsupported() {
    let server = MockServer::start().await;
    Mock::given(method("HEAD"))
        .and(path("/f"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("Content-Length", "10")
                .insert_header("Accept-Ranges", "none"),
        )
        .mount(&server)
        .await;

    let engine = engine_with_retries(0);
    let info = engine.fetch_info(&format!("{}/f", server.uri())).await.unwrap();
    assert!(!info.accept_ranges);
    // Absent header also means unsupported; checked by other tests omitting it
}

#[tokio::test]
async fn fetch_info_follows_redirects() {
    let server = MockServer::start().await;
    Mock::given(method("HEAD"))
        .and(path("/moved"))
        .respond_with(
            ResponseTemplate::new(302)
                .insert_header("Location", format!("{}/real.bin", server.uri())),
        )
        .mount(&server)
        .await;
    Mock::given(method("HEAD"))
        .and(path("/real.bin"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("Content-Length", "99")
                .insert_header("Accept-Ranges", "bytes"),
        )
        .mount(&server)
        .await;

    let engine = engine_with_retries(0);
    let info = engine
        .fetch_info(&format!("{}/moved", server.uri()))
        .await
        .unwrap();
    assert_eq!(info.content_length, 99);
    assert!(info.final_url.ends_with("/real.bin"));
}

#[tokio::test]
async fn head_405_falls_back_to_get() {
    let server = MockServer::start().await;
    Mock::given(method("HEAD"))
        .and(path("/no-head"))
        .respond_with(ResponseTemplate::new(405))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/no-head"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("Content-Length", "2048")
                .insert_header("Accept-Ranges", "bytes")
                .set_body_bytes(vec![0u8; 2048]),
        )
        .expect(1)
        .mount(&server)
        .await;

    let engine = engine_with_retries(0);
    let info = engine
        .fetch_info(&format!("{}/no-head", server.uri()))
        .await
        .unwrap();
    assert_eq!(info.content_length, 2048);
    assert!(info.accept_ranges);
}

#[tokio::test]
async fn fetch_info_404_fails_without_retry() {
    let server = MockServer::start().await;
    Mock::given(method("HEAD"))
        .and(path("/missing"))
        .respond_with(ResponseTemplate::new(404))
        .expect(1)
        .mount(&server)
        .await;

    let engine = engine_with_retries(3);
    let err = engine
        .fetch_info(&format!("{}/missing", server.uri()))
        .await
        .unwrap_err();
    match err {
        DownloadError::Http {
            http_status,
            retryable,
            ..
        } => {
            assert_eq!(http_status, 404);
            assert!(!retryable);
        }
        other => panic!("unexpected error: {other:?}"),
    }
}

// ── download & retry ───────────────────────────────────────────

#[tokio::test]
async fn download_full_body() {
    let server = MockServer::start().await;
    let content = test_body(10_000);
    Mock::given(method("GET"))
        .and(path("/data"))
        .respond_with(RangeResponder(content.clone()))
        .mount(&server)
        .await;

    let engine = engine_with_retries(0);
    let mut sink = VecSink(Vec::new());
    engine
        .download(&format!("{}/data", server.uri()), -1, -1, &mut sink, None)
        .await
        .unwrap();
    assert_eq!(sink.0, content);
}

#[tokio::test]
async fn download_honors_range() {
    let server = MockServer::start().await;
    let content = test_body(10_000);
    Mock::given(method("GET"))
        .and(path("/data"))
        .respond_with(RangeResponder(content.clone()))
        .mount(&server)
        .await;

    let engine = engine_with_retries(0);
    let mut sink = VecSink(Vec::new());
    engine
        .download(&format!("{}/data", server.uri()), 100, 199, &mut sink, None)
        .await
        .unwrap();
    assert_eq!(sink.0, content[100..=199].to_vec());
}

#[tokio::test]
async fn download_open_ended_range() {
    let server = MockServer::start().await;
    let content = test_body(5_000);
    Mock::given(method("GET"))
        .and(path("/data"))
        .respond_with(RangeResponder(content.clone()))
        .mount(&server)
        .await;

    let engine = engine_with_retries(0);
    let mut sink = VecSink(Vec::new());
    engine
        .download(&format!("{}/data", server.uri()), 4_000, -1, &mut sink, None)
        .await
        .unwrap();
    assert_eq!(sink.0, content[4_000..].to_vec());
}

#[tokio::test]
async fn retry_attempts_and_backoff_timing() {
    // max_retries = 2 means exactly 3 attempts with ~1 s and ~2 s pauses
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/flaky"))
        .respond_with(ResponseTemplate::new(500))
        .expect(3)
        .mount(&server)
        .await;

    let engine = engine_with_retries(2);
    let mut sink = VecSink(Vec::new());
    let start = Instant::now();
    let err = engine
        .download(&format!("{}/flaky", server.uri()), -1, -1, &mut sink, None)
        .await
        .unwrap_err();
    let elapsed = start.elapsed();

    assert!(err.is_retryable(), "exhausted retries keep the retryable tag");
    assert!(
        elapsed >= Duration::from_secs(3),
        "backoff 1s + 2s expected, got {elapsed:?}"
    );
    assert!(elapsed < Duration::from_secs(10));
    server.verify().await;
}

#[tokio::test]
async fn no_retry_on_4xx() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/forbidden"))
        .respond_with(ResponseTemplate::new(403))
        .expect(1)
        .mount(&server)
        .await;

    let engine = engine_with_retries(3);
    let mut sink = VecSink(Vec::new());
    let err = engine
        .download(&format!("{}/forbidden", server.uri()), -1, -1, &mut sink, None)
        .await
        .unwrap_err();
    assert!(!err.is_retryable());
    server.verify().await;
}

#[tokio::test]
async fn cancel_before_start_makes_no_requests() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&server)
        .await;

    let engine = engine_with_retries(3);
    engine.cancel();

    let mut sink = VecSink(Vec::new());
    let err = engine
        .download(&format!("{}/never", server.uri()), -1, -1, &mut sink, None)
        .await
        .unwrap_err();
    assert!(matches!(err, DownloadError::Cancelled));
    assert!(!err.is_retryable());

    let info_err = engine
        .fetch_info(&format!("{}/never", server.uri()))
        .await
        .unwrap_err();
    assert!(matches!(info_err, DownloadError::Cancelled));

    server.verify().await;
}

#[tokio::test]
async fn sink_abort_is_not_retried() {
    struct RefusingSink;

    #[async_trait]
    impl DataSink for RefusingSink {
        async fn write(&mut self, _chunk: &[u8]) -> usize {
            0
        }
    }

    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/data"))
        .respond_with(RangeResponder(test_body(4096)))
        .expect(1)
        .mount(&server)
        .await;

    let engine = engine_with_retries(3);
    let mut sink = RefusingSink;
    let err = engine
        .download(&format!("{}/data", server.uri()), -1, -1, &mut sink, None)
        .await
        .unwrap_err();
    assert!(!err.is_retryable());
    server.verify().await;
}

#[tokio::test]
async fn progress_callback_reports_cumulative_bytes() {
    use std::sync::atomic::{AtomicI64, Ordering};
    use std::sync::Arc;

    let server = MockServer::start().await;
    let content = test_body(8_192);
    Mock::given(method("GET"))
        .and(path("/data"))
        .respond_with(RangeResponder(content.clone()))
        .mount(&server)
        .await;

    let engine = engine_with_retries(0);
    let seen = Arc::new(AtomicI64::new(0));
    let seen_cb = Arc::clone(&seen);
    let callback = move |cumulative: i64| {
        seen_cb.fetch_max(cumulative, Ordering::SeqCst);
    };

    let mut sink = VecSink(Vec::new());
    engine
        .download(
            &format!("{}/data", server.uri()),
            -1,
            -1,
            &mut sink,
            Some(&callback),
        )
        .await
        .unwrap();
    assert_eq!(seen.load(Ordering::SeqCst), 8_192);
}
