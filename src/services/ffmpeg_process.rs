// FFmpeg Process Helpers
// Spawning, stderr line splitting, termination and CPU sampling for child processes

use regex::Regex;
use std::collections::{HashMap, VecDeque};
use std::path::Path;
use std::process::Stdio;
use std::sync::OnceLock;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;

// Windows: Hide console windows for spawned processes
#[cfg(windows)]
const CREATE_NO_WINDOW: u32 = 0x08000000;

const MAX_LINE_BYTES: usize = 64 * 1024;
const CPU_QUERY_TIMEOUT: Duration = Duration::from_secs(2);

/// Command for an FFmpeg-like binary: stdin closed, killed when the handle is dropped
pub(crate) fn ffmpeg_command(binary: &Path) -> Command {
    let mut cmd = Command::new(binary);
    cmd.stdin(Stdio::null()).kill_on_drop(true);
    #[cfg(windows)]
    cmd.creation_flags(CREATE_NO_WINDOW);
    cmd
}

/// Splits a byte stream into lines on `\n` or `\r`.
/// FFmpeg rewrites its progress line with carriage returns, so both count as terminators.
pub(crate) struct StderrLines<R> {
    reader: R,
    partial: Vec<u8>,
    ready: VecDeque<String>,
    eof: bool,
}

impl<R: AsyncRead + Unpin> StderrLines<R> {
    pub(crate) fn new(reader: R) -> Self {
        Self {
            reader,
            partial: Vec::new(),
            ready: VecDeque::new(),
            eof: false,
        }
    }

    /// Next non-empty line, or `None` once the stream is closed and drained
    pub(crate) async fn next_line(&mut self) -> Option<String> {
        loop {
            if let Some(line) = self.ready.pop_front() {
                return Some(line);
            }
            if self.eof {
                if self.partial.is_empty() {
                    return None;
                }
                return Some(self.take_partial());
            }

            let mut chunk = [0u8; 4096];
            match self.reader.read(&mut chunk).await {
                Ok(0) | Err(_) => self.eof = true,
                Ok(n) => {
                    for &byte in &chunk[..n] {
                        if byte == b'\n' || byte == b'\r' {
                            if !self.partial.is_empty() {
                                let line = self.take_partial();
                                self.ready.push_back(line);
                            }
                        } else {
                            self.partial.push(byte);
                            if self.partial.len() >= MAX_LINE_BYTES {
                                let line = self.take_partial();
                                self.ready.push_back(line);
                            }
                        }
                    }
                }
            }
        }
    }

    fn take_partial(&mut self) -> String {
        let line = String::from_utf8_lossy(&self.partial).into_owned();
        self.partial.clear();
        line
    }
}

/// Ask a process to exit: SIGTERM on Unix. Returns false where no signal could be sent,
/// in which case the caller has to fall back to a forced kill.
pub(crate) fn request_terminate(pid: u32) -> bool {
    #[cfg(unix)]
    {
        use nix::sys::signal::{kill, Signal};
        use nix::unistd::Pid;

        let Ok(raw) = i32::try_from(pid) else {
            return false;
        };
        match kill(Pid::from_raw(raw), Signal::SIGTERM) {
            Ok(()) => true,
            Err(e) => {
                log::debug!("SIGTERM to {pid} failed: {e}");
                false
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = pid;
        false
    }
}

/// Sample CPU usage for a set of PIDs with a single `ps` call.
/// Returns `None` where `ps` is unavailable or fails.
pub(crate) async fn query_cpu_usage(pids: &[u32]) -> Option<HashMap<u32, u32>> {
    if pids.is_empty() || cfg!(windows) {
        return None;
    }

    let pid_list = pids
        .iter()
        .map(u32::to_string)
        .collect::<Vec<_>>()
        .join(",");

    let mut cmd = Command::new("ps");
    cmd.args(["-p", &pid_list, "-o", "pid=,%cpu="])
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .kill_on_drop(true);

    let output = tokio::time::timeout(CPU_QUERY_TIMEOUT, cmd.output()).await.ok()?.ok()?;
    // ps exits non-zero when some PIDs are gone but still prints the rest
    Some(parse_ps_output(&String::from_utf8_lossy(&output.stdout)))
}

/// Parse `ps -o pid=,%cpu=` output into rounded integer percentages
pub(crate) fn parse_ps_output(output: &str) -> HashMap<u32, u32> {
    static LINE: OnceLock<Regex> = OnceLock::new();
    let re = LINE.get_or_init(|| Regex::new(r"^(\d+)\s+([\d.]+)").expect("valid ps regex"));

    output
        .lines()
        .filter_map(|line| {
            let caps = re.captures(line.trim())?;
            let pid = caps.get(1)?.as_str().parse::<u32>().ok()?;
            let cpu = caps.get(2)?.as_str().parse::<f64>().ok()?;
            Some((pid, cpu.round().max(0.0) as u32))
        })
        .collect()
}
