use crate::cmd;
use crate::config::DownloaderConfig;
use crate::paths::AppPaths;
use crate::tools::{self, ArchiveFetcher, HttpFetcher};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Mutex;

/// Where ffmpeg can be found.
///
/// `directory` is only set for a local copy; a system install is reached
/// through normal PATH resolution and needs no hint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FfmpegLocation {
    pub available: bool,
    pub directory: Option<PathBuf>,
}

impl FfmpegLocation {
    pub fn unavailable() -> Self {
        Self {
            available: false,
            directory: None,
        }
    }

    pub fn system() -> Self {
        Self {
            available: true,
            directory: None,
        }
    }

    pub fn local(directory: PathBuf) -> Self {
        Self {
            available: true,
            directory: Some(directory),
        }
    }

    /// Value for yt-dlp's `--ffmpeg-location`, if one is needed.
    pub fn location_hint(&self) -> Option<&Path> {
        self.directory.as_deref()
    }
}

pub struct Locator {
    paths: AppPaths,
    config: DownloaderConfig,
    system_program: PathBuf,
    fetcher: Box<dyn ArchiveFetcher>,
}

impl Locator {
    pub fn new(paths: AppPaths, config: DownloaderConfig) -> Self {
        Self {
            paths,
            config,
            system_program: PathBuf::from("ffmpeg"),
            fetcher: Box::new(HttpFetcher),
        }
    }

    pub fn with_fetcher(mut self, fetcher: impl ArchiveFetcher + 'static) -> Self {
        self.fetcher = Box::new(fetcher);
        self
    }

    pub fn with_system_program(mut self, program: impl Into<PathBuf>) -> Self {
        self.system_program = program.into();
        self
    }

    /// Local copy or system install, without touching the network.
    pub fn probe(&self) -> FfmpegLocation {
        if self.paths.ffmpeg_bin_path().exists() {
            tracing::debug!(dir = %self.paths.ffmpeg_dir().display(), "found local ffmpeg");
            return FfmpegLocation::local(self.paths.ffmpeg_dir());
        }
        if self.system_ffmpeg_runs() {
            tracing::debug!("system ffmpeg is available");
            return FfmpegLocation::system();
        }
        FfmpegLocation::unavailable()
    }

    /// Local copy, then system install, then a fresh download. Every failure
    /// ends up as [`FfmpegLocation::unavailable`].
    pub fn locate(&self) -> FfmpegLocation {
        let found = self.probe();
        if found.available {
            return found;
        }

        tracing::info!("no local or system ffmpeg; downloading");
        match tools::install_ffmpeg(&self.paths, &self.config, self.fetcher.as_ref()) {
            Ok(_) if self.paths.ffmpeg_bin_path().exists() => {
                FfmpegLocation::local(self.paths.ffmpeg_dir())
            }
            Ok(path) => {
                tracing::warn!(path = %path.display(), "ffmpeg install reported success but binary is missing");
                FfmpegLocation::unavailable()
            }
            Err(e) => {
                tracing::warn!(error = %e, "ffmpeg download failed");
                FfmpegLocation::unavailable()
            }
        }
    }

    fn system_ffmpeg_runs(&self) -> bool {
        cmd::command(&self.system_program)
            .arg("-version")
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .map(|s| s.success())
            .unwrap_or(false)
    }
}

/// Resolves once and remembers a successful answer.
///
/// An unavailable result is never cached, so the next [`get`](Self::get)
/// tries again (including another download attempt).
pub struct CachedLocator {
    locator: Locator,
    cached: Mutex<Option<FfmpegLocation>>,
}

impl CachedLocator {
    pub fn new(locator: Locator) -> Self {
        Self {
            locator,
            cached: Mutex::new(None),
        }
    }

    pub fn get(&self) -> FfmpegLocation {
        let mut cached = self.cached.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(location) = cached.as_ref() {
            return location.clone();
        }
        let location = self.locator.locate();
        if location.available {
            *cached = Some(location.clone());
        }
        location
    }

    /// Forgets the cached answer, e.g. after the local copy was deleted.
    pub fn invalidate(&self) {
        let mut cached = self.cached.lock().unwrap_or_else(|e| e.into_inner());
        *cached = None;
    }
}
