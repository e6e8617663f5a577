use crate::paths::AppPaths;
use crate::{EngineError, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

pub const WINDOWS_FFMPEG_ARCHIVE_URL: &str =
    "https://www.gyan.dev/ffmpeg/builds/ffmpeg-release-essentials.zip";
pub const MACOS_FFMPEG_ARCHIVE_URL: &str =
    "https://github.com/ffbinaries/ffbinaries-prebuilt/releases/download/v6.1/ffmpeg-6.1-macos-64.zip";
pub const LINUX_X64_FFMPEG_ARCHIVE_URL: &str =
    "https://github.com/ffbinaries/ffbinaries-prebuilt/releases/download/v6.1/ffmpeg-6.1-linux-64.zip";
pub const LINUX_ARM64_FFMPEG_ARCHIVE_URL: &str =
    "https://github.com/ffbinaries/ffbinaries-prebuilt/releases/download/v6.1/ffmpeg-6.1-linux-arm-64.zip";

/// Zip archive holding an `ffmpeg` binary for the host platform. Empty where
/// no prebuilt zip is known; set `ffmpeg_archive_url` or install ffmpeg on
/// PATH there.
pub fn default_ffmpeg_archive_url() -> &'static str {
    if cfg!(windows) {
        WINDOWS_FFMPEG_ARCHIVE_URL
    } else if cfg!(target_os = "macos") {
        MACOS_FFMPEG_ARCHIVE_URL
    } else if cfg!(all(target_os = "linux", target_arch = "x86_64")) {
        LINUX_X64_FFMPEG_ARCHIVE_URL
    } else if cfg!(all(target_os = "linux", target_arch = "aarch64")) {
        LINUX_ARM64_FFMPEG_ARCHIVE_URL
    } else {
        ""
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DownloadKind {
    Video,
    Audio,
}

impl DownloadKind {
    pub fn label(self) -> &'static str {
        match self {
            DownloadKind::Video => "video",
            DownloadKind::Audio => "audio",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DownloaderConfig {
    /// Worker threads for playlist batches; `None` means one per CPU.
    pub max_workers: Option<usize>,
    /// Explicit yt-dlp program; skips the bundled/PATH/python lookup.
    pub ytdlp_program: Option<String>,
    pub ffmpeg_archive_url: String,
    /// Hex SHA-256 the fetched ffmpeg archive must match, when pinned.
    pub ffmpeg_archive_sha256: Option<String>,
    pub default_kind: DownloadKind,
    pub download_dir: Option<PathBuf>,
}

impl Default for DownloaderConfig {
    fn default() -> Self {
        Self {
            max_workers: None,
            ytdlp_program: None,
            ffmpeg_archive_url: default_ffmpeg_archive_url().to_string(),
            ffmpeg_archive_sha256: None,
            default_kind: DownloadKind::Video,
            download_dir: None,
        }
    }
}

impl DownloaderConfig {
    pub fn effective_download_dir(&self, paths: &AppPaths) -> PathBuf {
        self.download_dir
            .clone()
            .unwrap_or_else(|| paths.default_download_dir())
    }
}

pub fn load_config(paths: &AppPaths) -> Result<DownloaderConfig> {
    let path = paths.config_path();
    if !path.exists() {
        return Ok(DownloaderConfig::default());
    }
    let bytes = std::fs::read(&path)?;
    let parsed: DownloaderConfig = serde_json::from_slice(&bytes).map_err(|e| {
        EngineError::InvalidInput(format!(
            "failed to parse config at {}: {e}",
            path.to_string_lossy()
        ))
    })?;
    Ok(parsed)
}

pub fn save_config(paths: &AppPaths, config: &DownloaderConfig) -> Result<()> {
    let path = paths.config_path();
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let json = serde_json::to_string_pretty(config)?;
    std::fs::write(&path, format!("{json}\n"))?;
    Ok(())
}
