use crate::cmd;
use crate::config::{DownloadKind, DownloaderConfig};
use crate::paths::AppPaths;
use crate::status::StatusSink;
use crate::{EngineError, Result};
use regex::Regex;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::OnceLock;

const VIDEO_FORMAT_SELECTOR: &str = "bestvideo[ext=mp4]+bestaudio/best";
const OUTPUT_TEMPLATE: &str = "%(title)s.%(ext)s";
const WATCH_URL_PREFIX: &str = "https://www.youtube.com/watch?v=";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputLine {
    Forward,
    Discard,
}

/// Decides whether a line of yt-dlp output is worth showing to the user.
///
/// Percentage and speed lines arrive several times a second per download
/// and would drown everything else out.
pub fn classify_output_line(line: &str) -> OutputLine {
    static NOISY_RE: OnceLock<Regex> = OnceLock::new();
    let noisy = NOISY_RE.get_or_init(|| Regex::new(r"(?i)%|speed").unwrap());

    let trimmed = line.trim();
    if trimmed.is_empty() || noisy.is_match(trimmed) {
        OutputLine::Discard
    } else {
        OutputLine::Forward
    }
}

pub fn is_playlist_url(url: &str) -> bool {
    url.to_lowercase().contains("playlist")
}

pub fn build_download_args(
    kind: DownloadKind,
    destination: &Path,
    ffmpeg_dir: Option<&Path>,
    url: &str,
) -> Vec<String> {
    let mut args = vec!["--newline".to_string()];
    match kind {
        DownloadKind::Video => {
            args.push("-f".to_string());
            args.push(VIDEO_FORMAT_SELECTOR.to_string());
        }
        DownloadKind::Audio => {
            args.push("--extract-audio".to_string());
            args.push("--audio-format".to_string());
            args.push("mp3".to_string());
        }
    }
    args.push("-o".to_string());
    args.push(
        destination
            .join(OUTPUT_TEMPLATE)
            .to_string_lossy()
            .to_string(),
    );
    if kind == DownloadKind::Video {
        args.push("--merge-output-format".to_string());
        args.push("mp4".to_string());
    }
    if let Some(dir) = ffmpeg_dir {
        args.push("--ffmpeg-location".to_string());
        args.push(dir.to_string_lossy().to_string());
    }
    args.push(url.to_string());
    args
}

#[derive(Debug, Deserialize)]
struct FlatPlaylist {
    entries: Option<Vec<FlatPlaylistEntry>>,
}

#[derive(Debug, Deserialize)]
struct FlatPlaylistEntry {
    id: Option<String>,
}

/// Watch URLs for every entry of a `--flat-playlist -J` dump that carries
/// an id.
pub fn playlist_entry_urls(json: &[u8]) -> Result<Vec<String>> {
    let parsed: FlatPlaylist = serde_json::from_slice(json)?;
    Ok(parsed
        .entries
        .unwrap_or_default()
        .into_iter()
        .filter_map(|e| e.id)
        .map(|id| id.trim().to_string())
        .filter(|id| !id.is_empty())
        .map(|id| format!("{WATCH_URL_PREFIX}{id}"))
        .collect())
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Candidate {
    program: PathBuf,
    prefix: Vec<String>,
}

/// yt-dlp invocation, resolved against a configured program, the bundled
/// copy, `yt-dlp` on PATH, and finally the python module.
///
/// The first candidate that answers `--version` is remembered and used for
/// every later call. A failed resolution is not remembered.
#[derive(Debug, Clone)]
pub struct YtDlp {
    candidates: Vec<Candidate>,
    resolved: OnceLock<Candidate>,
}

impl YtDlp {
    pub fn new(paths: &AppPaths, config: &DownloaderConfig) -> Self {
        if let Some(program) = config.ytdlp_program.as_deref() {
            let program = program.trim();
            if !program.is_empty() {
                return Self::with_program(program);
            }
        }

        let mut candidates = Vec::new();
        let bundled = paths.bundled_ytdlp_path();
        if bundled.exists() {
            candidates.push(Candidate {
                program: bundled,
                prefix: Vec::new(),
            });
        }
        candidates.push(Candidate {
            program: PathBuf::from("yt-dlp"),
            prefix: Vec::new(),
        });
        for python in ["python", "python3"] {
            candidates.push(Candidate {
                program: PathBuf::from(python),
                prefix: vec!["-m".to_string(), "yt_dlp".to_string()],
            });
        }
        Self::from_candidates(candidates)
    }

    /// A single explicit program. It is used as-is, without a version check.
    pub fn with_program(program: impl Into<PathBuf>) -> Self {
        Self::from_candidates(vec![Candidate {
            program: program.into(),
            prefix: Vec::new(),
        }])
    }

    fn from_candidates(candidates: Vec<Candidate>) -> Self {
        Self {
            candidates,
            resolved: OnceLock::new(),
        }
    }

    fn resolve(&self) -> Result<&Candidate> {
        if let Some(candidate) = self.resolved.get() {
            return Ok(candidate);
        }
        if let [only] = self.candidates.as_slice() {
            return Ok(only);
        }

        let mut failures: Vec<String> = Vec::new();
        for candidate in &self.candidates {
            let output = cmd::command(&candidate.program)
                .args(&candidate.prefix)
                .arg("--version")
                .stdin(Stdio::null())
                .output();
            let output = match output {
                Ok(o) => o,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => {
                    failures.push(format!("{} could not start: {e}", candidate.program.display()));
                    continue;
                }
            };

            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            if output.status.success() && !stderr.contains("No module named") {
                tracing::debug!(program = %candidate.program.display(), "using yt-dlp candidate");
                return Ok(self.resolved.get_or_init(|| candidate.clone()));
            }
            failures.push(format!(
                "{} failed (code={:?}): {}",
                candidate.program.display(),
                output.status.code(),
                if stderr.is_empty() { "unknown error" } else { stderr.as_str() }
            ));
        }

        if failures.is_empty() {
            Err(EngineError::ExternalToolMissing {
                tool: "yt-dlp".to_string(),
            })
        } else {
            Err(EngineError::ExternalToolFailed {
                tool: "yt-dlp".to_string(),
                code: None,
                stderr: failures.join("; "),
            })
        }
    }

    /// Downloads one URL into `destination`, forwarding interesting output
    /// lines to `sink`.
    ///
    /// `Ok(false)` means yt-dlp ran and exited non-zero. `Err` means it could
    /// not be run at all.
    pub fn download(
        &self,
        kind: DownloadKind,
        url: &str,
        destination: &Path,
        ffmpeg_dir: Option<&Path>,
        sink: &StatusSink,
    ) -> Result<bool> {
        let label = kind.label();
        let args = build_download_args(kind, destination, ffmpeg_dir, url);
        sink.send(format!("Starting {label} download: {url}"));

        let candidate = self.resolve()?;
        let mut command = cmd::command(&candidate.program);
        command.args(&candidate.prefix).args(&args);

        let status = cmd::run_streaming(&mut command, |line| {
            tracing::trace!(target: "clipfetch_engine::ytdlp::output", "{line}");
            if classify_output_line(line) == OutputLine::Forward {
                sink.send(line.trim());
            }
        })
        .map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => EngineError::ExternalToolMissing {
                tool: "yt-dlp".to_string(),
            },
            _ => EngineError::Io(e),
        })?;

        if status.success() {
            sink.send(format!("Completed {label}: {url}"));
            Ok(true)
        } else {
            tracing::warn!(url, code = ?status.code(), "yt-dlp exited with failure");
            sink.send(format!("Error downloading {label}: {url}"));
            Ok(false)
        }
    }

    /// Expands a playlist URL into one watch URL per entry.
    pub fn expand_playlist(&self, url: &str) -> Result<Vec<String>> {
        let candidate = self.resolve()?;
        let output = cmd::command(&candidate.program)
            .args(&candidate.prefix)
            .args(["--flat-playlist", "-J", url])
            .stdin(Stdio::null())
            .output()
            .map_err(|e| match e.kind() {
                std::io::ErrorKind::NotFound => EngineError::ExternalToolMissing {
                    tool: "yt-dlp".to_string(),
                },
                _ => EngineError::Io(e),
            })?;

        if !output.status.success() {
            return Err(EngineError::ExternalToolFailed {
                tool: "yt-dlp".to_string(),
                code: output.status.code(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        let urls = playlist_entry_urls(&output.stdout)?;
        tracing::info!(url, entries = urls.len(), "playlist expanded");
        Ok(urls)
    }
}
