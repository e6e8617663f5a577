use crate::batch::{BatchReport, BatchRunner, CancelToken};
use crate::batch_log::BatchLog;
use crate::config::{DownloadKind, DownloaderConfig};
use crate::locator::{CachedLocator, FfmpegLocation, Locator};
use crate::paths::AppPaths;
use crate::status::StatusSink;
use crate::ytdlp::{self, YtDlp};
use crate::{EngineError, Result};
use std::path::PathBuf;
use std::sync::Arc;
use std::thread;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadRequest {
    pub url: String,
    pub destination: PathBuf,
    pub kind: DownloadKind,
}

#[derive(Debug, Clone)]
pub enum SessionOutcome {
    Single { url: String, success: bool },
    Playlist(BatchReport),
    EmptyPlaylist,
}

pub fn validate_request(request: &DownloadRequest) -> Result<()> {
    let url = request.url.trim();
    if url.is_empty() {
        return Err(EngineError::InvalidInput(format!(
            "please enter a URL for {}",
            request.kind.label()
        )));
    }
    url::Url::parse(url)
        .map_err(|e| EngineError::InvalidInput(format!("not a valid URL ({e}): {url}")))?;
    if !request.destination.is_dir() {
        return Err(EngineError::InvalidInput(format!(
            "download folder does not exist: {}",
            request.destination.to_string_lossy()
        )));
    }
    Ok(())
}

pub struct Session {
    paths: AppPaths,
    config: DownloaderConfig,
    locator: CachedLocator,
    ytdlp: YtDlp,
}

impl Session {
    pub fn new(paths: AppPaths, config: DownloaderConfig) -> Self {
        let locator = CachedLocator::new(Locator::new(paths.clone(), config.clone()));
        let ytdlp = YtDlp::new(&paths, &config);
        Self::with_parts(paths, config, locator, ytdlp)
    }

    pub fn with_parts(
        paths: AppPaths,
        config: DownloaderConfig,
        locator: CachedLocator,
        ytdlp: YtDlp,
    ) -> Self {
        Self {
            paths,
            config,
            locator,
            ytdlp,
        }
    }

    /// Checks that must pass before any download starts: ffmpeg is reachable
    /// (fetching it if needed) and the request itself makes sense.
    pub fn preflight(&self, request: &DownloadRequest) -> Result<FfmpegLocation> {
        let location = self.locator.get();
        if !location.available {
            return Err(EngineError::ToolUnavailable {
                tool: "ffmpeg".to_string(),
                detail: "not found locally or on PATH, and the automatic download failed"
                    .to_string(),
            });
        }
        validate_request(request)?;
        Ok(location)
    }

    /// Runs pre-flight checks on the calling thread, then hands the download
    /// to one background thread. Status goes to `sink` and to a per-batch
    /// log under `logs/batches`.
    pub fn start(self: &Arc<Self>, request: DownloadRequest, sink: StatusSink) -> Result<DownloadHandle> {
        let location = self.preflight(&request)?;

        let sink = match BatchLog::create(&self.paths) {
            Ok(log) => {
                let log = Arc::new(log);
                log.record_or_warn(
                    "info",
                    "session_started",
                    serde_json::json!({
                        "url": request.url,
                        "kind": request.kind.label(),
                        "destination": request.destination.to_string_lossy(),
                    }),
                );
                log.tee(sink)
            }
            Err(e) => {
                tracing::warn!(error = %e, "batch log unavailable; continuing without it");
                sink
            }
        };

        let cancel = CancelToken::new();
        let session = Arc::clone(self);
        let worker_cancel = cancel.clone();
        let join = thread::spawn(move || session.execute(&request, &location, &sink, &worker_cancel));

        Ok(DownloadHandle { cancel, join })
    }

    /// Pre-flight plus the download itself, all on the calling thread.
    pub fn run(
        &self,
        request: &DownloadRequest,
        sink: &StatusSink,
        cancel: &CancelToken,
    ) -> Result<SessionOutcome> {
        let location = self.preflight(request)?;
        self.execute(request, &location, sink, cancel)
    }

    fn execute(
        &self,
        request: &DownloadRequest,
        location: &FfmpegLocation,
        sink: &StatusSink,
        cancel: &CancelToken,
    ) -> Result<SessionOutcome> {
        let url = request.url.trim();
        let kind = request.kind;
        let hint = location.location_hint();

        if !ytdlp::is_playlist_url(url) {
            let success = match self
                .ytdlp
                .download(kind, url, &request.destination, hint, sink)
            {
                Ok(success) => success,
                Err(e) => {
                    sink.send(format!("Exception downloading {}: {url}: {e}", kind.label()));
                    false
                }
            };
            return Ok(SessionOutcome::Single {
                url: url.to_string(),
                success,
            });
        }

        sink.send("Fetching playlist information...");
        let urls = match self.ytdlp.expand_playlist(url) {
            Ok(urls) => urls,
            Err(e) => {
                sink.send(format!("Error retrieving playlist videos: {e}"));
                return Err(e);
            }
        };
        if urls.is_empty() {
            sink.send("No videos found in playlist.");
            return Ok(SessionOutcome::EmptyPlaylist);
        }

        let mut runner = BatchRunner::new().cancel_token(cancel.clone());
        if let Some(workers) = self.config.max_workers {
            runner = runner.workers(workers);
        }
        let report = runner.run(
            &urls,
            &request.destination,
            |item, destination, sink| self.ytdlp.download(kind, item, destination, hint, sink),
            sink,
        );
        Ok(SessionOutcome::Playlist(report))
    }
}

/// Handle to a download running in the background.
#[derive(Debug)]
pub struct DownloadHandle {
    cancel: CancelToken,
    join: thread::JoinHandle<Result<SessionOutcome>>,
}

impl DownloadHandle {
    /// Stops dispatching further playlist items; items already running
    /// finish normally.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Token for triggering [`cancel`](Self::cancel) from another thread.
    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    pub fn join(self) -> Result<SessionOutcome> {
        self.join
            .join()
            .map_err(|_| EngineError::BackgroundPanicked)?
    }
}
