use std::io::{BufRead, IsTerminal};
use std::path::PathBuf;
use std::sync::Arc;

use clap::{value_parser, Arg, ArgAction, ArgMatches, Command};
use clipfetch_engine::batch::CancelToken;
use clipfetch_engine::config::{self, DownloadKind};
use clipfetch_engine::locator::Locator;
use clipfetch_engine::paths::AppPaths;
use clipfetch_engine::session::{DownloadRequest, Session, SessionOutcome};
use clipfetch_engine::status::StatusSink;
use clipfetch_engine::{batch_log, tools};

fn build_cli() -> Command {
    let download = Command::new("download")
        .about("Download a video, or every video of a playlist")
        .arg(
            Arg::new("url")
                .help("Video or playlist URL")
                .required(true)
                .num_args(1),
        )
        .arg(
            Arg::new("out_dir")
                .long("out-dir")
                .help("Existing folder to save into (default: <base-dir>/downloads)")
                .num_args(1),
        )
        .arg(
            Arg::new("audio")
                .long("audio")
                .help("Extract audio as MP3 instead of downloading MP4 video")
                .action(ArgAction::SetTrue),
        )
        .arg(
            Arg::new("workers")
                .long("workers")
                .help("Concurrent downloads for playlists (default: one per CPU)")
                .value_parser(value_parser!(usize))
                .num_args(1),
        );

    let locate = Command::new("locate")
        .about("Report where ffmpeg will be taken from")
        .arg(
            Arg::new("no_fetch")
                .long("no-fetch")
                .help("Only look for a local or system copy")
                .action(ArgAction::SetTrue),
        );

    let install = Command::new("install-ffmpeg")
        .about("Download ffmpeg into <base-dir>/tools/ffmpeg")
        .arg(
            Arg::new("force")
                .long("force")
                .help("Reinstall even if present")
                .action(ArgAction::SetTrue),
        );

    let config_cmd = Command::new("config")
        .about("Show or change saved settings")
        .subcommand_required(true)
        .subcommand(Command::new("show").about("Print the current settings"))
        .subcommand(
            Command::new("set-workers")
                .about("Playlist concurrency; 0 means one per CPU")
                .arg(
                    Arg::new("count")
                        .required(true)
                        .value_parser(value_parser!(usize)),
                ),
        )
        .subcommand(
            Command::new("set-download-dir")
                .about("Default download folder")
                .arg(Arg::new("dir").required(true).num_args(1)),
        );

    Command::new("clipfetch")
        .about("Video/audio downloader built on yt-dlp and ffmpeg")
        .subcommand_required(true)
        .arg_required_else_help(true)
        .arg(
            Arg::new("base_dir")
                .long("base-dir")
                .help("Data directory (default: $CLIPFETCH_BASE_DIR, else next to the executable)")
                .global(true)
                .num_args(1),
        )
        .subcommand(download)
        .subcommand(locate)
        .subcommand(install)
        .subcommand(config_cmd)
}

fn main() -> Result<(), String> {
    init_tracing();
    let matches = build_cli().get_matches();

    match matches.subcommand() {
        Some(("download", m)) => download(m),
        Some(("locate", m)) => locate(m),
        Some(("install-ffmpeg", m)) => install_ffmpeg(m),
        Some(("config", m)) => match m.subcommand() {
            Some(("show", sm)) => config_show(sm),
            Some(("set-workers", sm)) => config_set_workers(sm),
            Some(("set-download-dir", sm)) => config_set_download_dir(sm),
            _ => Err("unknown config command (try --help)".to_string()),
        },
        _ => Err("unknown command (try --help)".to_string()),
    }
}

fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "clipfetch=info,clipfetch_engine=warn".into());
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

fn resolve_paths(m: &ArgMatches) -> Result<AppPaths, String> {
    let paths = match m.get_one::<String>("base_dir") {
        Some(dir) => AppPaths::new(PathBuf::from(dir)),
        None => AppPaths::from_env_or_exe_dir().map_err(|e| e.to_string())?,
    };
    paths.ensure_dirs().map_err(|e| e.to_string())?;
    Ok(paths)
}

fn download(m: &ArgMatches) -> Result<(), String> {
    let paths = resolve_paths(m)?;
    let prune_paths = paths.clone();
    std::thread::spawn(move || {
        let _ = batch_log::prune_batch_logs(&prune_paths);
    });

    let mut config = config::load_config(&paths).map_err(|e| e.to_string())?;
    if let Some(workers) = m.get_one::<usize>("workers").copied() {
        config.max_workers = Some(workers);
    }

    let kind = if m.get_flag("audio") {
        DownloadKind::Audio
    } else {
        config.default_kind
    };

    let destination = match m.get_one::<String>("out_dir") {
        Some(dir) => PathBuf::from(dir),
        None => {
            let dir = config.effective_download_dir(&paths);
            std::fs::create_dir_all(&dir).map_err(|e| e.to_string())?;
            dir
        }
    };

    let url = m
        .get_one::<String>("url")
        .cloned()
        .ok_or_else(|| "a URL is required".to_string())?;

    let session = Arc::new(Session::new(paths, config));
    let (sink, rx) = StatusSink::channel();
    let handle = session
        .start(
            DownloadRequest {
                url,
                destination: destination.clone(),
                kind,
            },
            sink,
        )
        .map_err(|e| e.to_string())?;

    println!("Saving {} to {}", kind.label(), destination.to_string_lossy());
    if std::io::stdin().is_terminal() {
        println!("Type q and press Enter to stop after the downloads in progress.");
        let token = handle.cancel_token();
        std::thread::spawn(move || watch_for_cancel(token));
    }
    for message in rx {
        println!("{message}");
    }

    match handle.join().map_err(|e| e.to_string())? {
        SessionOutcome::Single { success: true, .. } => Ok(()),
        SessionOutcome::Single { url, success: false } => Err(format!("download failed: {url}")),
        SessionOutcome::EmptyPlaylist => Ok(()),
        SessionOutcome::Playlist(report) => {
            println!(
                "Summary: {} succeeded, {} failed, {} errored, {} skipped",
                report.succeeded(),
                report.failed(),
                report.faulted(),
                report.skipped()
            );
            let bad = report.failed() + report.faulted();
            if bad > 0 {
                Err(format!("{bad} of {} items did not download", report.total))
            } else {
                Ok(())
            }
        }
    }
}

fn is_cancel_command(line: &str) -> bool {
    matches!(line.trim().to_ascii_lowercase().as_str(), "q" | "quit" | "cancel")
}

fn watch_for_cancel(token: CancelToken) {
    for line in std::io::stdin().lock().lines() {
        let Ok(line) = line else {
            break;
        };
        if is_cancel_command(&line) {
            println!("Canceling: downloads already running will finish first.");
            token.cancel();
            break;
        }
    }
}

fn locate(m: &ArgMatches) -> Result<(), String> {
    let paths = resolve_paths(m)?;
    let config = config::load_config(&paths).map_err(|e| e.to_string())?;
    let locator = Locator::new(paths.clone(), config);
    let location = if m.get_flag("no_fetch") {
        locator.probe()
    } else {
        locator.locate()
    };

    if !location.available {
        println!("FFmpeg is not available.");
        return Err("ffmpeg not found".to_string());
    }
    match location.location_hint() {
        Some(dir) => println!("FFmpeg is available locally at: {}", dir.to_string_lossy()),
        None => println!("FFmpeg is available system-wide."),
    }
    if let Some(version) = tools::ffmpeg_tools_status(&paths).ffmpeg_version {
        println!("{version}");
    }
    Ok(())
}

fn install_ffmpeg(m: &ArgMatches) -> Result<(), String> {
    let paths = resolve_paths(m)?;
    let config = config::load_config(&paths).map_err(|e| e.to_string())?;

    let status = tools::ffmpeg_tools_status(&paths);
    if status.installed && !m.get_flag("force") {
        println!("FFmpeg: already installed ({})", status.ffmpeg_path);
        return Ok(());
    }

    println!("FFmpeg: downloading from {}", config.ffmpeg_archive_url);
    let installed =
        tools::install_ffmpeg(&paths, &config, &tools::HttpFetcher).map_err(|e| e.to_string())?;
    println!("FFmpeg: installed ({})", installed.to_string_lossy());
    Ok(())
}

fn config_show(m: &ArgMatches) -> Result<(), String> {
    let paths = resolve_paths(m)?;
    let config = config::load_config(&paths).map_err(|e| e.to_string())?;
    let json = serde_json::to_string_pretty(&config).map_err(|e| e.to_string())?;
    println!("Config: {}", paths.config_path().to_string_lossy());
    println!("{json}");
    Ok(())
}

fn config_set_workers(m: &ArgMatches) -> Result<(), String> {
    let paths = resolve_paths(m)?;
    let mut config = config::load_config(&paths).map_err(|e| e.to_string())?;
    let count = m
        .get_one::<usize>("count")
        .copied()
        .ok_or_else(|| "count is required".to_string())?;
    config.max_workers = if count == 0 { None } else { Some(count) };
    config::save_config(&paths, &config).map_err(|e| e.to_string())?;
    match config.max_workers {
        Some(n) => println!("Playlist downloads will use {n} workers"),
        None => println!("Playlist downloads will use one worker per CPU"),
    }
    Ok(())
}

fn config_set_download_dir(m: &ArgMatches) -> Result<(), String> {
    let paths = resolve_paths(m)?;
    let mut config = config::load_config(&paths).map_err(|e| e.to_string())?;
    let dir = m
        .get_one::<String>("dir")
        .map(PathBuf::from)
        .ok_or_else(|| "dir is required".to_string())?;
    if !dir.is_dir() {
        return Err(format!("not a directory: {}", dir.to_string_lossy()));
    }
    config.download_dir = Some(dir.clone());
    config::save_config(&paths, &config).map_err(|e| e.to_string())?;
    println!("Default download folder: {}", dir.to_string_lossy());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_definition_is_consistent() {
        build_cli().debug_assert();
    }

    #[test]
    fn cancel_commands() {
        assert!(is_cancel_command("q"));
        assert!(is_cancel_command(" Cancel \n"));
        assert!(!is_cancel_command(""));
        assert!(!is_cancel_command("quick"));
    }

    #[test]
    fn download_flags_parse() {
        let m = build_cli()
            .try_get_matches_from([
                "clipfetch",
                "--base-dir",
                "/tmp/cf",
                "download",
                "https://youtu.be/x",
                "--audio",
                "--workers",
                "3",
            ])
            .expect("parse");
        let (name, sub) = m.subcommand().expect("subcommand");
        assert_eq!(name, "download");
        assert!(sub.get_flag("audio"));
        assert_eq!(sub.get_one::<usize>("workers").copied(), Some(3));
        assert_eq!(
            sub.get_one::<String>("base_dir").map(String::as_str),
            Some("/tmp/cf")
        );
    }
}
