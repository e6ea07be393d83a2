// ffmpeg / ffprobe wrappers
//
// Probing is a plain blocking `Command::output`. Encodes run as a child
// process that the calling worker waits on; the child is killed when the run
// is cancelled. Progress is parsed from `-progress pipe:1` and forwarded to an
// optional observer channel.

use crate::error::AppError;
use crate::pipeline::CancelFlag;
use serde::Deserialize;
use std::ffi::OsString;
use std::io::{BufRead, BufReader, Read};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::thread::JoinHandle;
use std::time::Duration;

const POLL_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Debug, Deserialize)]
struct FFprobeOutput {
    streams: Option<Vec<FFprobeStream>>,
    format: Option<FFprobeFormat>,
}

#[derive(Debug, Deserialize)]
struct FFprobeStream {
    codec_type: Option<String>,
    width: Option<u32>,
    height: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct FFprobeFormat {
    duration: Option<String>,
}

/// Stream facts the manifest needs. Width and height are 0 without a video stream.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct VideoInfo {
    pub width: u32,
    pub height: u32,
    pub duration_seconds: Option<f64>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct EncodeProgress {
    pub file: PathBuf,
    pub out_time_seconds: f64,
    pub percent: Option<f64>,
    pub finished: bool,
}

#[derive(Debug, PartialEq)]
enum ProgressLine {
    OutTime(f64),
    Checkpoint { finished: bool },
}

pub fn parse_probe_output(stdout: &[u8]) -> Result<VideoInfo, AppError> {
    let output: FFprobeOutput = serde_json::from_slice(stdout)
        .map_err(|e| AppError::Probe(format!("Failed to parse ffprobe output: {}", e)))?;

    let mut info = VideoInfo::default();
    if let Some(stream) = output
        .streams
        .iter()
        .flatten()
        .find(|s| s.codec_type.as_deref() == Some("video"))
    {
        info.width = stream.width.unwrap_or(0);
        info.height = stream.height.unwrap_or(0);
    }
    info.duration_seconds = output
        .format
        .and_then(|f| f.duration)
        .and_then(|d| d.parse().ok());
    Ok(info)
}

/// Run ffprobe on a file and read its video stream size.
pub fn probe(ffprobe: &Path, path: &Path) -> Result<VideoInfo, AppError> {
    let output = Command::new(ffprobe)
        .args(["-v", "quiet", "-print_format", "json", "-show_format", "-show_streams"])
        .arg(path)
        .output()
        .map_err(|e| AppError::Probe(format!("Failed to run ffprobe: {}", e)))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(AppError::Probe(format!(
            "ffprobe failed on {:?} ({}): {}",
            path,
            output.status,
            stderr.trim()
        )));
    }

    parse_probe_output(&output.stdout)
}

/// Scale filter bounding both sides by `max`, keeping the aspect ratio and
/// even dimensions.
pub fn scale_filter(max: u32) -> String {
    format!(
        "scale=w='min({max},iw)':h='min({max},ih)':force_original_aspect_ratio=decrease:force_divisible_by=2"
    )
}

pub fn transcode_args(source: &Path, partial: &Path, max: u32) -> Vec<OsString> {
    let mut args: Vec<OsString> = ["-hide_banner", "-nostdin", "-y", "-loglevel", "error", "-i"]
        .iter()
        .map(OsString::from)
        .collect();
    args.push(source.as_os_str().to_owned());
    let filter = scale_filter(max);
    for arg in [
        "-vf",
        filter.as_str(),
        "-c:v",
        "libvpx-vp9",
        "-b:v",
        "0",
        "-crf",
        "33",
        "-row-mt",
        "1",
        "-c:a",
        "libopus",
        "-f",
        "webm",
        "-progress",
        "pipe:1",
        "-nostats",
    ] {
        args.push(OsString::from(arg));
    }
    args.push(partial.as_os_str().to_owned());
    args
}

pub fn thumbnail_args(source: &Path, partial: &Path, size: u32, seek_seconds: f64) -> Vec<OsString> {
    let mut args: Vec<OsString> = vec![
        "-hide_banner".into(),
        "-nostdin".into(),
        "-y".into(),
        "-loglevel".into(),
        "error".into(),
        "-ss".into(),
        format!("{:.3}", seek_seconds.max(0.0)).into(),
        "-i".into(),
    ];
    args.push(source.as_os_str().to_owned());
    args.push("-frames:v".into());
    args.push("1".into());
    args.push("-vf".into());
    args.push(format!("scale={}:{}", size, size).into());
    args.push(partial.as_os_str().to_owned());
    args
}

fn parse_progress_line(line: &str) -> Option<ProgressLine> {
    let (key, value) = line.trim().split_once('=')?;
    match key {
        // Both keys carry microseconds.
        "out_time_us" | "out_time_ms" => value
            .parse::<f64>()
            .ok()
            .map(|us| ProgressLine::OutTime(us / 1_000_000.0)),
        "progress" => Some(ProgressLine::Checkpoint {
            finished: value == "end",
        }),
        _ => None,
    }
}

fn spawn_progress_reader(
    stdout: impl Read + Send + 'static,
    file: PathBuf,
    duration: Option<f64>,
    observer: Option<crossbeam_channel::Sender<EncodeProgress>>,
) -> JoinHandle<()> {
    std::thread::spawn(move || {
        let mut out_time = 0.0;
        for line in BufReader::new(stdout).lines() {
            let Ok(line) = line else { break };
            match parse_progress_line(&line) {
                Some(ProgressLine::OutTime(seconds)) => out_time = seconds,
                Some(ProgressLine::Checkpoint { finished }) => {
                    if let Some(observer) = &observer {
                        let percent = duration
                            .filter(|d| *d > 0.0)
                            .map(|d| (out_time / d * 100.0).clamp(0.0, 100.0));
                        // A gone observer must not affect the encode.
                        let _ = observer.send(EncodeProgress {
                            file: file.clone(),
                            out_time_seconds: out_time,
                            percent,
                            finished,
                        });
                    }
                }
                None => {}
            }
        }
    })
}

fn spawn_stderr_reader(stderr: impl Read + Send + 'static) -> JoinHandle<String> {
    std::thread::spawn(move || {
        let mut text = String::new();
        let _ = BufReader::new(stderr).read_to_string(&mut text);
        text
    })
}

/// A running ffmpeg invocation owned by one worker.
pub struct FfmpegProcess {
    label: String,
    child: Child,
    stderr: Option<JoinHandle<String>>,
    progress: Option<JoinHandle<()>>,
}

impl FfmpegProcess {
    pub fn start(
        program: &Path,
        args: &[OsString],
        file: &Path,
        duration: Option<f64>,
        observer: Option<crossbeam_channel::Sender<EncodeProgress>>,
    ) -> Result<Self, AppError> {
        let label = format!("{} {:?}", program.display(), file);
        log::debug!("Starting {} {:?}", program.display(), args);

        let mut child = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| AppError::Encode(format!("Failed to start {}: {}", label, e)))?;

        let stderr = child.stderr.take().map(spawn_stderr_reader);
        let progress = child
            .stdout
            .take()
            .map(|stdout| spawn_progress_reader(stdout, file.to_path_buf(), duration, observer));

        Ok(Self {
            label,
            child,
            stderr,
            progress,
        })
    }

    fn drain(&mut self) -> String {
        if let Some(progress) = self.progress.take() {
            let _ = progress.join();
        }
        self.stderr
            .take()
            .and_then(|h| h.join().ok())
            .unwrap_or_default()
    }

    /// Blocks until the process exits. On cancellation the process is killed
    /// and `AppError::Cancelled` is returned.
    pub fn wait(mut self, cancel: &CancelFlag) -> Result<(), AppError> {
        loop {
            if cancel.is_cancelled() {
                log::warn!("Killing {}", self.label);
                if let Err(e) = self.child.kill() {
                    log::warn!("Could not kill {}: {}", self.label, e);
                }
                let _ = self.child.wait();
                self.drain();
                return Err(AppError::Cancelled);
            }

            if let Some(status) = self.child.try_wait()? {
                let stderr = self.drain();
                if status.success() {
                    return Ok(());
                }
                return Err(AppError::Encode(format!(
                    "{} exited with {}: {}",
                    self.label,
                    status,
                    stderr.trim()
                )));
            }

            std::thread::sleep(POLL_INTERVAL);
        }
    }
}
