//! Resumable ranged downloads.
//!
//! The driver pulls chunks from a [`RangeSource`] and recovers from
//! transient failures and truncated bodies by re-requesting from the
//! current offset. Two retry budgets apply: errors (failed requests,
//! mid-stream faults) and partial resumes (clean EOF before the expected
//! length). Both reset after every advancing read of at least
//! max(1 MiB, 5% of the expected size), so a slow-but-moving transfer never
//! exhausts its budget.

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use culprit::Culprit;
use hondana_core::ByteUnit;
use rand::Rng;
use tracing::{debug, trace};

pub type Result<T> = culprit::Result<T, FetchErr>;

#[derive(Debug, thiserror::Error)]
pub enum FetchErr {
    #[error("http status {0}")]
    Status(u16),

    #[error("io error: {0}")]
    Io(std::io::ErrorKind),

    #[error("object store error: {0}")]
    ObjectStore(#[from] object_store::Error),

    #[error("range not satisfiable before end of file")]
    RangeConflict,

    #[error("retry budget exhausted after {attempts} attempts")]
    RetriesExhausted { attempts: u32 },

    #[error("response delivered more bytes than the expected {expected}")]
    Overrun { expected: u64 },
}

impl From<std::io::Error> for FetchErr {
    fn from(err: std::io::Error) -> Self {
        FetchErr::Io(err.kind())
    }
}

impl FetchErr {
    /// Transient network faults, 5xx, and 429 retry with backoff inside the
    /// download loop. Everything else surfaces immediately.
    pub fn is_retryable(&self) -> bool {
        match self {
            FetchErr::Status(status) => *status == 429 || (500..600).contains(status),
            FetchErr::Io(_) => true,
            FetchErr::ObjectStore(err) => !matches!(err, object_store::Error::NotFound { .. }),
            FetchErr::RangeConflict
            | FetchErr::RetriesExhausted { .. }
            | FetchErr::Overrun { .. } => false,
        }
    }
}

/// A pull-based chunk stream for one response body.
#[async_trait]
pub trait ChunkReader: Send {
    /// The next chunk, `None` at end of body. Errors mid-body count against
    /// the error budget and resume from the current offset.
    async fn next(&mut self) -> Result<Option<Bytes>>;
}

/// Response to a ranged fetch.
pub enum RangeReply {
    /// Body starts at byte zero (the server ignored a non-zero range).
    Full(Box<dyn ChunkReader>),
    /// Body starts at the requested offset.
    Partial(Box<dyn ChunkReader>),
    /// 416. Completion when the offset equals the total size.
    RangeNotSatisfiable,
}

/// One remote object addressable by byte offset.
#[async_trait]
pub trait RangeSource: Send + Sync {
    /// HEAD-like probe; returns the expected total length when the source
    /// knows it. Used for truncation detection.
    async fn probe(&self) -> Result<Option<u64>>;

    /// GET from `offset`. Offset zero is an unconditional full fetch.
    async fn fetch(&self, offset: u64) -> Result<RangeReply>;
}

#[derive(Debug, Clone)]
pub struct FetchOptions {
    pub error_retries: u32,
    pub resume_retries: u32,
    pub base_backoff: Duration,
    pub max_backoff: Duration,
    /// Minimum interval between progress callbacks (~15 Hz by default).
    pub progress_interval: Duration,
}

impl Default for FetchOptions {
    fn default() -> Self {
        FetchOptions {
            error_retries: 5,
            resume_retries: 8,
            base_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(30),
            progress_interval: Duration::from_millis(66),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FetchProgress {
    pub loaded: u64,
    pub total: Option<u64>,
}

/// Drives a download to completion, returning the full body.
pub async fn fetch_resumable(
    source: &dyn RangeSource,
    opts: &FetchOptions,
    mut on_progress: impl FnMut(FetchProgress) + Send,
) -> Result<Bytes> {
    let total = source.probe().await?;
    let reset_threshold = match total {
        Some(total) => ByteUnit::from_mb(1).as_u64().max(total / 20),
        None => ByteUnit::from_mb(1).as_u64(),
    };

    let mut buf: Vec<u8> = Vec::with_capacity(total.unwrap_or(0) as usize);
    let mut error_budget = opts.error_retries;
    let mut resume_budget = opts.resume_retries;
    let mut attempts: u32 = 0;
    let mut advanced_since_reset: u64 = 0;
    let mut last_progress: Option<tokio::time::Instant> = None;

    'request: loop {
        attempts += 1;
        let offset = buf.len() as u64;

        let reply = match source.fetch(offset).await {
            Ok(reply) => reply,
            Err(err) => {
                if err.ctx().is_retryable() && error_budget > 0 {
                    error_budget -= 1;
                    backoff(opts, attempts).await;
                    continue 'request;
                }
                return Err(err);
            }
        };

        let mut reader = match reply {
            RangeReply::RangeNotSatisfiable => {
                if total == Some(offset) {
                    // the file is already fully delivered
                    break 'request;
                }
                return Err(Culprit::new(FetchErr::RangeConflict));
            }
            RangeReply::Full(reader) => {
                if offset > 0 {
                    // the server ignored our range request; start over
                    debug!(offset, "range ignored by server, restarting from zero");
                    buf.clear();
                }
                reader
            }
            RangeReply::Partial(reader) => reader,
        };

        loop {
            match reader.next().await {
                Ok(Some(chunk)) => {
                    buf.extend_from_slice(&chunk);
                    advanced_since_reset += chunk.len() as u64;
                    if advanced_since_reset >= reset_threshold {
                        error_budget = opts.error_retries;
                        resume_budget = opts.resume_retries;
                        advanced_since_reset = 0;
                    }
                    if let Some(expected) = total
                        && buf.len() as u64 > expected
                    {
                        return Err(Culprit::new(FetchErr::Overrun { expected }));
                    }
                    let due = last_progress
                        .is_none_or(|at| at.elapsed() >= opts.progress_interval);
                    if due {
                        last_progress = Some(tokio::time::Instant::now());
                        on_progress(FetchProgress { loaded: buf.len() as u64, total });
                    }
                }
                Ok(None) => {
                    match total {
                        // truncated body: resume from the current offset
                        Some(expected) if (buf.len() as u64) < expected => {
                            if resume_budget == 0 {
                                return Err(Culprit::new(FetchErr::RetriesExhausted {
                                    attempts,
                                }));
                            }
                            resume_budget -= 1;
                            trace!(
                                loaded = buf.len(),
                                expected,
                                "body truncated, resuming"
                            );
                            backoff(opts, attempts).await;
                            continue 'request;
                        }
                        _ => break 'request,
                    }
                }
                Err(err) => {
                    if err.ctx().is_retryable() && error_budget > 0 {
                        error_budget -= 1;
                        backoff(opts, attempts).await;
                        continue 'request;
                    }
                    return Err(err);
                }
            }
        }
    }

    on_progress(FetchProgress { loaded: buf.len() as u64, total });
    Ok(Bytes::from(buf))
}

async fn backoff(opts: &FetchOptions, attempt: u32) {
    let exp = opts
        .base_backoff
        .saturating_mul(1u32 << attempt.min(6))
        .min(opts.max_backoff);
    let jitter = rand::rng().random_range(0..=exp.as_millis() as u64 / 2);
    tokio::time::sleep(exp + Duration::from_millis(jitter)).await;
}

/// [`RangeSource`] over any `object_store` object. Backs the path-addressed
/// provider.
pub struct StoreRangeSource<'a> {
    store: &'a dyn object_store::ObjectStore,
    path: object_store::path::Path,
}

impl<'a> StoreRangeSource<'a> {
    pub fn new(store: &'a dyn object_store::ObjectStore, path: object_store::path::Path) -> Self {
        StoreRangeSource { store, path }
    }
}

#[async_trait]
impl RangeSource for StoreRangeSource<'_> {
    async fn probe(&self) -> Result<Option<u64>> {
        let meta = self.store.head(&self.path).await.map_err(FetchErr::from)?;
        Ok(Some(meta.size))
    }

    async fn fetch(&self, offset: u64) -> Result<RangeReply> {
        use futures::StreamExt;

        let mut options = object_store::GetOptions::default();
        if offset > 0 {
            options.range = Some(object_store::GetRange::Offset(offset));
        }
        let result = match self.store.get_opts(&self.path, options).await {
            Ok(result) => result,
            Err(object_store::Error::NotSupported { .. }) if offset > 0 => {
                // stores without range support deliver the whole object
                let result = self.store.get(&self.path).await.map_err(FetchErr::from)?;
                return Ok(RangeReply::Full(Box::new(StreamChunkReader {
                    stream: result.into_stream(),
                })));
            }
            Err(err) => return Err(Culprit::new(FetchErr::from(err))),
        };

        let reader = StreamChunkReader { stream: result.into_stream() };
        if offset > 0 {
            Ok(RangeReply::Partial(Box::new(reader)))
        } else {
            Ok(RangeReply::Full(Box::new(reader)))
        }
    }
}

struct StreamChunkReader {
    stream: futures::stream::BoxStream<'static, object_store::Result<Bytes>>,
}

#[async_trait]
impl ChunkReader for StreamChunkReader {
    async fn next(&mut self) -> Result<Option<Bytes>> {
        use futures::StreamExt;
        match self.stream.next().await {
            Some(Ok(chunk)) => Ok(Some(chunk)),
            Some(Err(err)) => Err(Culprit::new(FetchErr::from(err))),
            None => Ok(None),
        }
    }
}

/// [`RangeSource`] over a plain HTTP url (share links). Requests run on the
/// blocking pool; chunks cross back over a channel.
pub struct HttpRangeSource {
    url: String,
    agent: ureq::Agent,
}

impl HttpRangeSource {
    pub fn new(url: impl Into<String>) -> Self {
        HttpRangeSource {
            url: url.into(),
            agent: ureq::Agent::config_builder()
                .http_status_as_error(false)
                .timeout_connect(Some(Duration::from_secs(30)))
                .build()
                .new_agent(),
        }
    }
}

#[async_trait]
impl RangeSource for HttpRangeSource {
    async fn probe(&self) -> Result<Option<u64>> {
        let agent = self.agent.clone();
        let url = self.url.clone();
        let result = tokio::task::spawn_blocking(move || {
            let resp = agent
                .head(&url)
                .call()
                .map_err(|_| FetchErr::Io(std::io::ErrorKind::ConnectionAborted))?;
            if !resp.status().is_success() {
                return Err(FetchErr::Status(resp.status().as_u16()));
            }
            Ok(resp
                .headers()
                .get(http::header::CONTENT_LENGTH)
                .and_then(|len| len.to_str().ok())
                .and_then(|len| len.parse::<u64>().ok()))
        })
        .await
        .map_err(|_| FetchErr::Io(std::io::ErrorKind::Interrupted))?;
        Ok(result?)
    }

    async fn fetch(&self, offset: u64) -> Result<RangeReply> {
        let agent = self.agent.clone();
        let url = self.url.clone();
        let (status_tx, status_rx) = tokio::sync::oneshot::channel::<Result<u16>>();
        let (tx, rx) = tokio::sync::mpsc::channel::<Result<Option<Bytes>>>(4);

        // the request and body reads are blocking; the body keeps streaming
        // through the channel after the status is reported back
        tokio::task::spawn_blocking(move || {
            let mut req = agent.get(&url);
            if offset > 0 {
                req = req.header(http::header::RANGE, format!("bytes={offset}-"));
            }
            let resp = match req.call() {
                Ok(resp) => resp,
                Err(_) => {
                    let _ = status_tx.send(Err(Culprit::new(FetchErr::Io(
                        std::io::ErrorKind::ConnectionAborted,
                    ))));
                    return;
                }
            };
            let status = resp.status().as_u16();
            if status_tx.send(Ok(status)).is_err() {
                return;
            }
            if status == 416 || !(200..300).contains(&status) {
                return;
            }

            let mut body = resp.into_body().into_reader();
            let mut chunk = vec![0u8; 64 * 1024];
            loop {
                use std::io::Read;
                match body.read(&mut chunk) {
                    Ok(0) => {
                        let _ = tx.blocking_send(Ok(None));
                        break;
                    }
                    Ok(n) => {
                        let data = Bytes::copy_from_slice(&chunk[..n]);
                        if tx.blocking_send(Ok(Some(data))).is_err() {
                            break;
                        }
                    }
                    Err(err) => {
                        let _ = tx.blocking_send(Err(Culprit::new(FetchErr::from(err))));
                        break;
                    }
                }
            }
        });

        let status = status_rx
            .await
            .map_err(|_| FetchErr::Io(std::io::ErrorKind::Interrupted))??;
        if status == 416 {
            return Ok(RangeReply::RangeNotSatisfiable);
        }
        if !(200..300).contains(&status) {
            return Err(Culprit::new(FetchErr::Status(status)));
        }
        let reader = Box::new(ChannelChunkReader { rx });
        if status == 206 && offset > 0 {
            Ok(RangeReply::Partial(reader))
        } else {
            Ok(RangeReply::Full(reader))
        }
    }
}

struct ChannelChunkReader {
    rx: tokio::sync::mpsc::Receiver<Result<Option<Bytes>>>,
}

#[async_trait]
impl ChunkReader for ChannelChunkReader {
    async fn next(&mut self) -> Result<Option<Bytes>> {
        match self.rx.recv().await {
            Some(item) => item,
            // sender dropped mid-body: surface as a transient fault
            None => Err(Culprit::new(FetchErr::Io(
                std::io::ErrorKind::UnexpectedEof,
            ))),
        }
    }
}

#[cfg(test)]
pub(crate) mod testutil {
    use super::*;
    use parking_lot::Mutex;

    /// Scripted source: serves `data`, truncating each response according to
    /// the configured cut list.
    pub struct FlakySource {
        pub data: Bytes,
        /// Per-request truncation points; once exhausted, responses run to
        /// completion.
        pub cuts: Mutex<Vec<u64>>,
        /// When true the source answers ranged requests with a full body.
        pub ignores_ranges: bool,
        /// Errors to inject before any response succeeds.
        pub request_errors: Mutex<u32>,
    }

    impl FlakySource {
        pub fn new(data: impl Into<Bytes>) -> Self {
            FlakySource {
                data: data.into(),
                cuts: Mutex::new(Vec::new()),
                ignores_ranges: false,
                request_errors: Mutex::new(0),
            }
        }

        pub fn with_cuts(self, cuts: Vec<u64>) -> Self {
            *self.cuts.lock() = cuts;
            self
        }
    }

    pub struct SliceReader {
        chunks: Vec<Bytes>,
    }

    #[async_trait]
    impl ChunkReader for SliceReader {
        async fn next(&mut self) -> Result<Option<Bytes>> {
            if self.chunks.is_empty() {
                Ok(None)
            } else {
                Ok(Some(self.chunks.remove(0)))
            }
        }
    }

    #[async_trait]
    impl RangeSource for FlakySource {
        async fn probe(&self) -> Result<Option<u64>> {
            Ok(Some(self.data.len() as u64))
        }

        async fn fetch(&self, offset: u64) -> Result<RangeReply> {
            {
                let mut errors = self.request_errors.lock();
                if *errors > 0 {
                    *errors -= 1;
                    return Err(Culprit::new(FetchErr::Status(503)));
                }
            }

            let total = self.data.len() as u64;
            if offset >= total {
                return Ok(RangeReply::RangeNotSatisfiable);
            }

            let start = if self.ignores_ranges { 0 } else { offset };
            let end = {
                let mut cuts = self.cuts.lock();
                if cuts.is_empty() {
                    total
                } else {
                    cuts.remove(0).clamp(start, total)
                }
            };

            let body = self.data.slice(start as usize..end as usize);
            // deliver in 8KiB chunks so progress and resets exercise
            let chunks = body
                .chunks(8 * 1024)
                .map(Bytes::copy_from_slice)
                .collect();
            let reader = Box::new(SliceReader { chunks });
            if start == 0 {
                Ok(RangeReply::Full(reader))
            } else {
                Ok(RangeReply::Partial(reader))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{testutil::FlakySource, *};
    use assert_matches::assert_matches;

    fn payload(len: usize) -> Bytes {
        let mut data = Vec::with_capacity(len);
        for i in 0..len {
            data.push((i % 251) as u8);
        }
        Bytes::from(data)
    }

    #[tokio::test(start_paused = true)]
    async fn test_clean_download() {
        let data = payload(100 * 1024);
        let source = FlakySource::new(data.clone());
        let out = fetch_resumable(&source, &FetchOptions::default(), |_| {})
            .await
            .unwrap();
        assert_eq!(out, data);
    }

    #[tokio::test(start_paused = true)]
    async fn test_resumes_after_truncation() {
        // 1 MiB advertised, stream cut at 400 KiB; the ranged re-request
        // delivers the remainder
        let data = payload(1024 * 1024);
        let source =
            FlakySource::new(data.clone()).with_cuts(vec![400 * 1024]);
        let mut last = FetchProgress { loaded: 0, total: None };
        let out = fetch_resumable(&source, &FetchOptions::default(), |p| last = p)
            .await
            .unwrap();
        assert_eq!(out, data);
        assert_eq!(last.loaded, data.len() as u64);
        assert_eq!(last.total, Some(data.len() as u64));
    }

    #[tokio::test(start_paused = true)]
    async fn test_arbitrary_truncation_prefixes() {
        // any prefix-truncation schedule must still deliver exact bytes
        let data = payload(256 * 1024);
        for cuts in [
            vec![1],
            vec![8 * 1024, 16 * 1024, 24 * 1024],
            vec![100_000, 100_000, 200_000],
            vec![255 * 1024],
        ] {
            let source = FlakySource::new(data.clone()).with_cuts(cuts.clone());
            let out = fetch_resumable(&source, &FetchOptions::default(), |_| {})
                .await
                .unwrap_or_else(|e| panic!("cuts {cuts:?} failed: {e:?}"));
            assert_eq!(out, data, "cuts {cuts:?}");
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_server_ignoring_range_restarts_from_zero() {
        let data = payload(64 * 1024);
        let mut source = FlakySource::new(data.clone()).with_cuts(vec![10 * 1024]);
        source.ignores_ranges = true;
        let out = fetch_resumable(&source, &FetchOptions::default(), |_| {})
            .await
            .unwrap();
        assert_eq!(out, data);
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_errors_retry_with_backoff() {
        let data = payload(16 * 1024);
        let source = FlakySource::new(data.clone());
        *source.request_errors.lock() = 3;
        let out = fetch_resumable(&source, &FetchOptions::default(), |_| {})
            .await
            .unwrap();
        assert_eq!(out, data);
    }

    #[tokio::test(start_paused = true)]
    async fn test_error_budget_exhausts() {
        let data = payload(16 * 1024);
        let source = FlakySource::new(data);
        *source.request_errors.lock() = 100;
        let err = fetch_resumable(&source, &FetchOptions::default(), |_| {})
            .await
            .unwrap_err();
        assert_matches!(err.ctx(), FetchErr::Status(503));
    }

    #[tokio::test(start_paused = true)]
    async fn test_resume_budget_exhausts_without_progress() {
        let data = payload(512 * 1024);
        // every response dies at the same offset; no advancing read of
        // threshold size ever happens, so the resume budget runs dry
        let source = FlakySource::new(data).with_cuts(vec![1024; 64]);
        let opts = FetchOptions { resume_retries: 3, ..Default::default() };
        let err = fetch_resumable(&source, &opts, |_| {}).await.unwrap_err();
        assert_matches!(err.ctx(), FetchErr::RetriesExhausted { .. });
    }

    #[tokio::test(start_paused = true)]
    async fn test_budgets_reset_after_advancing_reads() {
        // 7 truncations on a budget of 2, but every response advances a
        // full reset threshold (1 MiB here), so the budget refills and the
        // download still completes
        let len = 8 * 1024 * 1024;
        let data = payload(len);
        let step = 1024 * 1024;
        let cuts: Vec<u64> = (1..8).map(|i| (i * step) as u64).collect();
        let source = FlakySource::new(data.clone()).with_cuts(cuts);
        let opts = FetchOptions { resume_retries: 2, ..Default::default() };
        let out = fetch_resumable(&source, &opts, |_| {}).await.unwrap();
        assert_eq!(out.len(), len);
    }
}
