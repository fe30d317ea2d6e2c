//! Bounded-concurrency media segment downloads
//!
//! Segments are fetched through `buffer_unordered`, written to
//! `<prefix>_<index:06>.<ext>` files and returned in playlist order. The
//! first failure aborts the whole batch: dropping the stream drops every
//! in-flight request.

use futures::stream::{self, StreamExt};
use reqwest::header::RANGE;
use reqwest::{Client, StatusCode};
use std::path::{Path, PathBuf};
use tokio::fs::File;
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::core::error_handling::{PipelineError, RetryPolicy};
use crate::core::progress::{ProgressCallback, ProgressRange};
use crate::parsers::m3u8_parser::{reference_extension, SegmentRequest};
use crate::utils::validation::redact_query;

/// One list of segments destined for a single output directory
#[derive(Debug, Clone)]
pub struct SegmentBatch {
    /// Segments in playlist order, init segment first when present
    pub requests: Vec<SegmentRequest>,
    pub out_dir: PathBuf,
    /// File name prefix, e.g. `seg` for video and `aud` for audio
    pub prefix: String,
    /// Progress slice this batch reports into
    pub range: ProgressRange,
}

#[derive(Debug, Clone)]
pub struct SegmentFetcher {
    client: Client,
    retry: RetryPolicy,
    max_concurrent: usize,
}

impl SegmentFetcher {
    pub fn new(client: Client, retry: RetryPolicy, max_concurrent: usize) -> Self {
        Self {
            client,
            retry,
            max_concurrent: max_concurrent.max(1),
        }
    }

    /// Download every segment of `batch`; returns the files in playlist order
    pub async fn fetch_all(
        &self,
        batch: &SegmentBatch,
        token: &CancellationToken,
        progress: ProgressCallback,
    ) -> Result<Vec<PathBuf>, PipelineError> {
        let total = batch.requests.len();
        info!(
            "Fetching {} segments into {:?} ({} concurrent)",
            total, batch.out_dir, self.max_concurrent
        );
        tokio::fs::create_dir_all(&batch.out_dir).await?;

        let mut completed = 0usize;
        let mut files: Vec<Option<PathBuf>> = vec![None; total];

        let mut downloads = stream::iter(0..total)
            .map(|index| {
                let request = &batch.requests[index];
                let target = segment_path(&batch.out_dir, &batch.prefix, index, &request.url);
                async move {
                    if token.is_cancelled() {
                        return Err(PipelineError::Cancelled);
                    }
                    self.fetch_one(index, request, &target, token).await?;
                    Ok::<_, PipelineError>((index, target))
                }
            })
            .buffer_unordered(self.max_concurrent);

        loop {
            let next = tokio::select! {
                _ = token.cancelled() => return Err(PipelineError::Cancelled),
                next = downloads.next() => next,
            };
            let Some(result) = next else { break };
            let (index, path) = result?;

            files[index] = Some(path);
            completed += 1;
            progress(batch.range.map_count(completed, total));
        }

        files
            .into_iter()
            .enumerate()
            .map(|(index, file)| {
                file.ok_or_else(|| PipelineError::Io(format!("segment {} was never written", index)))
            })
            .collect()
    }

    async fn fetch_one(
        &self,
        index: usize,
        request: &SegmentRequest,
        target: &Path,
        token: &CancellationToken,
    ) -> Result<u64, PipelineError> {
        self.retry
            .run(token, |attempt| async move {
                debug!(
                    "Fetching segment #{} {} (attempt {})",
                    index,
                    redact_query(&request.url),
                    attempt
                );
                self.fetch_attempt(index, request, target).await
            })
            .await
    }

    async fn fetch_attempt(
        &self,
        index: usize,
        request: &SegmentRequest,
        target: &Path,
    ) -> Result<u64, PipelineError> {
        let url = request.url.as_str();
        let mut builder = self.client.get(url);
        if let Some(range) = &request.byte_range {
            builder = builder.header(RANGE, range.header_value());
        }
        let mut response = builder
            .send()
            .await
            .map_err(|e| PipelineError::segment_transport(index, url, &e))?;

        let status = response.status();
        if !status.is_success() {
            return Err(PipelineError::SegmentFetch {
                index,
                url: url.to_string(),
                status: Some(status.as_u16()),
                reason: status.canonical_reason().unwrap_or("request failed").to_string(),
            });
        }
        // A full 200 body would duplicate the whole resource for every sub-range
        if request.byte_range.is_some() && status != StatusCode::PARTIAL_CONTENT {
            return Err(PipelineError::SegmentFetch {
                index,
                url: url.to_string(),
                status: Some(status.as_u16()),
                reason: "server ignored the byte range request".to_string(),
            });
        }

        let mut file = File::create(target).await?;
        let mut written = 0u64;
        while let Some(chunk) = response
            .chunk()
            .await
            .map_err(|e| PipelineError::segment_transport(index, url, &e))?
        {
            file.write_all(&chunk).await?;
            written += chunk.len() as u64;
        }
        file.flush().await?;

        if written == 0 {
            return Err(PipelineError::SegmentFetch {
                index,
                url: url.to_string(),
                status: Some(status.as_u16()),
                reason: "empty segment body".to_string(),
            });
        }
        Ok(written)
    }
}

/// Scratch file name for segment `index`
pub fn segment_path(dir: &Path, prefix: &str, index: usize, url: &str) -> PathBuf {
    let ext = reference_extension(url)
        .filter(|ext| !ext.is_empty() && ext.len() <= 5)
        .unwrap_or_else(|| "bin".to_string());
    dir.join(format!("{}_{:06}.{}", prefix, index, ext))
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::Arc;
    use std::time::Duration;
    use tempfile::tempdir;
    use crate::core::test_fixtures::{Fixture, Reply};
    use crate::parsers::m3u8_parser::ByteRange;

    fn fetcher(concurrency: usize) -> SegmentFetcher {
        SegmentFetcher::new(
            Client::new(),
            RetryPolicy::new(2, Duration::from_millis(1)),
            concurrency,
        )
    }

    fn serve_segments(server: &Fixture, count: usize) -> Vec<SegmentRequest> {
        let mut urls = Vec::new();
        for i in 0..count {
            // Later segments answer faster so completion order differs from playlist order
            let delay = Duration::from_millis(((count - i) * 15) as u64);
            let path = format!("/seg{}.ts", i);
            server.route(&path, [Reply::ok(vec![i as u8; 188]).delayed(delay)]);
            urls.push(SegmentRequest {
                url: server.url(&path),
                byte_range: None,
            });
        }
        urls
    }

    #[tokio::test]
    async fn test_segments_returned_in_playlist_order_with_monotonic_progress() {
        let server = Fixture::start().await;
        let urls = serve_segments(&server, 6);
        let dir = tempdir().unwrap();

        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let progress: ProgressCallback = Arc::new(move |p| sink.lock().push(p));

        let batch = SegmentBatch {
            requests: urls,
            out_dir: dir.path().join("job"),
            prefix: "seg".to_string(),
            range: ProgressRange::new(10.0, 70.0),
        };
        let files = fetcher(4)
            .fetch_all(&batch, &CancellationToken::new(), progress)
            .await
            .unwrap();

        assert_eq!(files.len(), 6);
        for (i, file) in files.iter().enumerate() {
            assert_eq!(
                file.file_name().unwrap().to_string_lossy(),
                format!("seg_{:06}.ts", i)
            );
            let bytes = std::fs::read(file).unwrap();
            assert_eq!(bytes[0], i as u8);
        }

        let seen = seen.lock().clone();
        assert_eq!(seen.len(), 6);
        assert!(seen.windows(2).all(|w| w[0] <= w[1]));
        assert_eq!(*seen.last().unwrap(), 70.0);
    }

    #[tokio::test]
    async fn test_first_failure_aborts_batch() {
        let server = Fixture::start().await;
        let mut urls = serve_segments(&server, 3);
        server.route("/gone.ts", [Reply::status(404)]);
        urls.insert(
            1,
            SegmentRequest {
                url: server.url("/gone.ts"),
                byte_range: None,
            },
        );

        let dir = tempdir().unwrap();
        let batch = SegmentBatch {
            requests: urls,
            out_dir: dir.path().to_path_buf(),
            prefix: "seg".to_string(),
            range: ProgressRange::FULL,
        };
        let err = fetcher(2)
            .fetch_all(&batch, &CancellationToken::new(), crate::core::progress::noop_progress())
            .await
            .unwrap_err();

        match err {
            PipelineError::SegmentFetch { index, status, .. } => {
                assert_eq!(index, 1);
                assert_eq!(status, Some(404));
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert_eq!(server.hits("/gone.ts"), 1);
    }

    #[tokio::test]
    async fn test_cancelled_before_start() {
        let server = Fixture::start().await;
        let urls = serve_segments(&server, 2);
        let dir = tempdir().unwrap();
        let token = CancellationToken::new();
        token.cancel();

        let batch = SegmentBatch {
            requests: urls,
            out_dir: dir.path().to_path_buf(),
            prefix: "seg".to_string(),
            range: ProgressRange::FULL,
        };
        let err = fetcher(2)
            .fetch_all(&batch, &token, crate::core::progress::noop_progress())
            .await
            .unwrap_err();
        assert!(err.is_cancelled());
    }

    #[tokio::test]
    async fn test_byte_range_segments_fetch_their_slice() {
        let server = Fixture::start().await;
        server.route("/main.ts", [Reply::ranged("AAAABBBBCC")]);
        let dir = tempdir().unwrap();

        let requests = [(0, 4), (4, 4), (8, 2)]
            .into_iter()
            .map(|(offset, length)| SegmentRequest {
                url: server.url("/main.ts"),
                byte_range: Some(ByteRange { offset, length }),
            })
            .collect();
        let batch = SegmentBatch {
            requests,
            out_dir: dir.path().to_path_buf(),
            prefix: "seg".to_string(),
            range: ProgressRange::FULL,
        };
        let files = fetcher(3)
            .fetch_all(&batch, &CancellationToken::new(), crate::core::progress::noop_progress())
            .await
            .unwrap();

        let bodies: Vec<String> = files
            .iter()
            .map(|f| std::fs::read_to_string(f).unwrap())
            .collect();
        assert_eq!(bodies, ["AAAA", "BBBB", "CC"]);
    }

    #[tokio::test]
    async fn test_byte_range_ignored_by_server_is_an_error() {
        let server = Fixture::start().await;
        server.route("/main.ts", [Reply::ok("AAAABBBB")]);
        let dir = tempdir().unwrap();

        let batch = SegmentBatch {
            requests: vec![SegmentRequest {
                url: server.url("/main.ts"),
                byte_range: Some(ByteRange { offset: 0, length: 4 }),
            }],
            out_dir: dir.path().to_path_buf(),
            prefix: "seg".to_string(),
            range: ProgressRange::FULL,
        };
        let err = fetcher(1)
            .fetch_all(&batch, &CancellationToken::new(), crate::core::progress::noop_progress())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("ignored the byte range"));
    }

    #[test]
    fn test_segment_path_naming() {
        let dir = Path::new("/tmp/job");
        assert_eq!(
            segment_path(dir, "seg", 7, "https://h/a/7.m4s?token=x"),
            PathBuf::from("/tmp/job/seg_000007.m4s")
        );
        assert_eq!(
            segment_path(dir, "aud", 0, "https://h/a/chunk"),
            PathBuf::from("/tmp/job/aud_000000.bin")
        );
    }
}
