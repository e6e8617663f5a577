use std::ffi::OsStr;
use std::io::{BufRead, BufReader, Read};
use std::process::{Command, ExitStatus, Stdio};
use std::sync::mpsc;
use std::thread;

pub fn command(program: impl AsRef<OsStr>) -> Command {
    let mut cmd = Command::new(program);
    configure_for_background(&mut cmd);
    cmd
}

#[cfg(windows)]
fn configure_for_background(cmd: &mut Command) {
    use std::os::windows::process::CommandExt;

    // Keep yt-dlp and ffmpeg from flashing console windows while a batch runs.
    const CREATE_NO_WINDOW: u32 = 0x0800_0000;
    cmd.creation_flags(CREATE_NO_WINDOW);
}

#[cfg(not(windows))]
fn configure_for_background(_cmd: &mut Command) {}

/// Runs `cmd` to completion, handing every line of stdout and stderr to
/// `on_line` on the calling thread as it arrives.
///
/// Both pipes are drained by reader threads feeding one channel, so a chatty
/// stderr can never block the child while stdout is being consumed.
pub fn run_streaming(
    cmd: &mut Command,
    mut on_line: impl FnMut(&str),
) -> std::io::Result<ExitStatus> {
    cmd.stdin(Stdio::null());
    cmd.stdout(Stdio::piped());
    cmd.stderr(Stdio::piped());

    let mut child = cmd.spawn()?;

    let (tx, rx) = mpsc::channel::<String>();
    let mut readers = Vec::with_capacity(2);
    if let Some(stdout) = child.stdout.take() {
        readers.push(spawn_line_reader(stdout, tx.clone()));
    }
    if let Some(stderr) = child.stderr.take() {
        readers.push(spawn_line_reader(stderr, tx.clone()));
    }
    drop(tx);

    for line in rx {
        on_line(&line);
    }

    for reader in readers {
        let _ = reader.join();
    }
    child.wait()
}

fn spawn_line_reader<R>(pipe: R, tx: mpsc::Sender<String>) -> thread::JoinHandle<()>
where
    R: Read + Send + 'static,
{
    thread::spawn(move || {
        let reader = BufReader::new(pipe);
        for line in reader.split(b'\n') {
            let Ok(raw) = line else {
                break;
            };
            let text = String::from_utf8_lossy(&raw);
            if tx.send(text.trim_end_matches('\r').to_string()).is_err() {
                break;
            }
        }
    })
}
