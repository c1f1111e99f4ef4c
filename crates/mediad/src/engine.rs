use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::process::Stdio;

use async_trait::async_trait;
use log::{debug, info};
use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::{Result, ServiceError};
use crate::hwaccel::HwCaps;

/// Number of trailing stderr lines attached to engine diagnostics
const DIAGNOSTIC_TAIL_LINES: usize = 40;

/// Which parameter set a conversion runs with
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EncodePath {
    Hardware,
    Software,
}

/// One conversion request handed to the engine
#[derive(Debug, Clone)]
pub struct ConvertSpec {
    pub input: PathBuf,
    pub output: PathBuf,
    pub output_format: String,
    pub quality: String,
}

/// Interface to the external transcoding engine.
///
/// The engine is a black box: it accepts input media plus a parameter set
/// and either produces output media or fails with diagnostics. Progress is
/// reported through a bounded channel; senders must never block on it.
#[async_trait]
pub trait TranscodeEngine: Send + Sync {
    /// Confirm the engine is invocable at all
    async fn validate(&self) -> Result<()>;

    /// Convert `spec.input` into `spec.output`, pushing coarse progress
    /// percentages into `progress` until the invocation terminates.
    async fn convert(
        &self,
        spec: &ConvertSpec,
        path: EncodePath,
        progress: mpsc::Sender<u8>,
        cancel: CancellationToken,
    ) -> Result<()>;

    /// Re-encode the `[start, start+duration)` range of `input` into
    /// `output` as a standalone segment.
    async fn extract_segment(
        &self,
        input: &Path,
        output: &Path,
        start: f64,
        duration: f64,
        cancel: CancellationToken,
    ) -> Result<()>;

    /// The capability record this engine was constructed with
    fn capabilities(&self) -> &HwCaps;
}

/// ffmpeg-backed implementation of [`TranscodeEngine`]
pub struct FfmpegEngine {
    ffmpeg_bin: PathBuf,
    ffprobe_bin: PathBuf,
    caps: HwCaps,
}

impl FfmpegEngine {
    pub fn new(ffmpeg_bin: PathBuf, ffprobe_bin: PathBuf, caps: HwCaps) -> Self {
        FfmpegEngine {
            ffmpeg_bin,
            ffprobe_bin,
            caps,
        }
    }

    /// Duration of the input in seconds, if ffprobe can determine it.
    /// Used only to turn stderr timestamps into percentages; a `None` here
    /// degrades progress to coarse increments, never fails the job.
    pub async fn probe_duration(&self, input: &Path) -> Option<f64> {
        let output = Command::new(&self.ffprobe_bin)
            .arg("-v")
            .arg("error")
            .arg("-show_entries")
            .arg("format=duration")
            .arg("-of")
            .arg("default=noprint_wrappers=1:nokey=1")
            .arg(input)
            .output()
            .await
            .ok()?;
        if !output.status.success() {
            return None;
        }
        String::from_utf8_lossy(&output.stdout)
            .trim()
            .parse::<f64>()
            .ok()
            .filter(|d| d.is_finite() && *d > 0.0)
    }

    /// Spawn ffmpeg, stream stderr for progress, and honor cancellation by
    /// killing the child. Returns `Engine` with the stderr tail on non-zero
    /// exit, `Cancelled` if the token fired first.
    async fn run(
        &self,
        args: Vec<String>,
        progress: Option<ProgressSink>,
        cancel: &CancellationToken,
    ) -> Result<()> {
        debug!("ffmpeg {}", args.join(" "));

        let mut child = Command::new(&self.ffmpeg_bin)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()?;

        let mut stderr = child
            .stderr
            .take()
            .ok_or_else(|| ServiceError::Engine("failed to capture ffmpeg stderr".to_string()))?;

        let mut tail: VecDeque<String> = VecDeque::with_capacity(DIAGNOSTIC_TAIL_LINES);
        let mut estimate: u8 = 0;
        let mut pending: Vec<u8> = Vec::new();
        let mut buf = [0u8; 4096];

        loop {
            let read = tokio::select! {
                _ = cancel.cancelled() => {
                    let _ = child.kill().await;
                    return Err(ServiceError::Cancelled);
                }
                read = stderr.read(&mut buf) => read,
            };
            match read {
                Ok(0) => break,
                Ok(n) => {
                    pending.extend_from_slice(&buf[..n]);
                    for line in drain_lines(&mut pending) {
                        note_line(line, &mut tail, &progress, &mut estimate);
                    }
                }
                Err(e) => {
                    debug!("ffmpeg stderr read ended: {}", e);
                    break;
                }
            }
        }
        if !pending.is_empty() {
            let line = String::from_utf8_lossy(&pending).into_owned();
            note_line(line, &mut tail, &progress, &mut estimate);
        }

        let status = tokio::select! {
            _ = cancel.cancelled() => None,
            status = child.wait() => Some(status),
        };

        match status {
            None => {
                let _ = child.kill().await;
                Err(ServiceError::Cancelled)
            }
            Some(status) => {
                let status = status?;
                if status.success() {
                    Ok(())
                } else {
                    let diagnostics: Vec<String> = tail.into_iter().collect();
                    Err(ServiceError::Engine(format!(
                        "ffmpeg exited with {}: {}",
                        status.code().unwrap_or(-1),
                        diagnostics.join("\n")
                    )))
                }
            }
        }
    }

    /// Conversion argument set for the selected path.
    ///
    /// The hardware variant follows the capability record: acceleration
    /// flags and optional decoder before `-i`, the record's encoder plus
    /// kind-specific rate control after it. The software variant is plain
    /// libx264/aac with a CRF/preset pair derived from the quality name.
    fn build_convert_args(&self, spec: &ConvertSpec, path: EncodePath) -> Vec<String> {
        let mut args: Vec<String> = Vec::new();

        match path {
            EncodePath::Hardware => {
                args.extend(self.caps.extra_args.iter().cloned());
                if let Some(decoder) = &self.caps.decode_codec {
                    args.push("-c:v".to_string());
                    args.push(decoder.clone());
                }
                args.push("-i".to_string());
                args.push(spec.input.to_string_lossy().into_owned());
                args.push("-c:v".to_string());
                args.push(
                    self.caps
                        .encode_codec
                        .clone()
                        .unwrap_or_else(|| "libx264".to_string()),
                );
                args.push("-c:a".to_string());
                args.push("aac".to_string());
                for arg in self.caps.kind_rate_control() {
                    args.push(arg);
                }
            }
            EncodePath::Software => {
                let (crf, preset) = quality_params(&spec.quality);
                args.push("-i".to_string());
                args.push(spec.input.to_string_lossy().into_owned());
                args.push("-c:v".to_string());
                args.push("libx264".to_string());
                args.push("-c:a".to_string());
                args.push("aac".to_string());
                args.push("-preset".to_string());
                args.push(preset.to_string());
                args.push("-crf".to_string());
                args.push(crf.to_string());
            }
        }

        args.push("-y".to_string());
        args.push(spec.output.to_string_lossy().into_owned());
        args
    }
}

impl HwCaps {
    /// Kind-specific rate-control flags appended after the encoder
    fn kind_rate_control(&self) -> Vec<String> {
        use crate::hwaccel::HwAccelKind;
        let flags: &[&str] = match self.kind {
            HwAccelKind::Nvidia => &["-preset", "p4", "-cq", "23"],
            HwAccelKind::Amd => &["-rc", "cqp", "-qp", "23"],
            HwAccelKind::Intel => &["-preset", "medium", "-global_quality", "23"],
            HwAccelKind::VideoToolbox => {
                &["-b:v", "0", "-q:v", "65", "-realtime", "1", "-allow_sw", "1"]
            }
            HwAccelKind::None => &[],
        };
        flags.iter().map(|s| s.to_string()).collect()
    }
}

struct ProgressSink {
    tx: mpsc::Sender<u8>,
    input_duration: Option<f64>,
}

#[async_trait]
impl TranscodeEngine for FfmpegEngine {
    async fn validate(&self) -> Result<()> {
        let output = Command::new(&self.ffmpeg_bin)
            .arg("-version")
            .output()
            .await
            .map_err(|e| {
                ServiceError::Engine(format!(
                    "ffmpeg not invocable at {}: {}",
                    self.ffmpeg_bin.display(),
                    e
                ))
            })?;
        if !output.status.success() {
            return Err(ServiceError::Engine("ffmpeg -version failed".to_string()));
        }
        Ok(())
    }

    async fn convert(
        &self,
        spec: &ConvertSpec,
        path: EncodePath,
        progress: mpsc::Sender<u8>,
        cancel: CancellationToken,
    ) -> Result<()> {
        let input_duration = self.probe_duration(&spec.input).await;
        let args = self.build_convert_args(spec, path);
        info!(
            "converting {} -> {} ({:?} path)",
            spec.input.display(),
            spec.output.display(),
            path
        );
        self.run(
            args,
            Some(ProgressSink {
                tx: progress,
                input_duration,
            }),
            &cancel,
        )
        .await
    }

    async fn extract_segment(
        &self,
        input: &Path,
        output: &Path,
        start: f64,
        duration: f64,
        cancel: CancellationToken,
    ) -> Result<()> {
        let args = build_segment_args(input, output, start, duration);
        self.run(args, None, &cancel).await
    }

    fn capabilities(&self) -> &HwCaps {
        &self.caps
    }
}

/// Re-encode between timestamps for cut accuracy; stream copy would snap to
/// keyframes. `-ss` before `-i` keeps the seek fast.
pub fn build_segment_args(input: &Path, output: &Path, start: f64, duration: f64) -> Vec<String> {
    vec![
        "-ss".to_string(),
        format!("{:.3}", start),
        "-i".to_string(),
        input.to_string_lossy().into_owned(),
        "-t".to_string(),
        format!("{:.3}", duration),
        "-c:v".to_string(),
        "libx264".to_string(),
        "-c:a".to_string(),
        "aac".to_string(),
        "-preset".to_string(),
        "ultrafast".to_string(),
        "-crf".to_string(),
        "23".to_string(),
        "-f".to_string(),
        "mp4".to_string(),
        "-movflags".to_string(),
        "+faststart".to_string(),
        "-y".to_string(),
        output.to_string_lossy().into_owned(),
    ]
}

/// CRF/preset pair for a quality profile name; unknown names get medium
pub fn quality_params(quality: &str) -> (u8, &'static str) {
    match quality {
        "low" => (28, "veryfast"),
        "high" => (18, "slow"),
        _ => (23, "medium"),
    }
}

/// Pop every complete line out of `pending`, leaving any unterminated
/// remainder in place. ffmpeg terminates its periodic stats updates with a
/// bare carriage return and everything else with a newline, so both count
/// as line ends; waiting for `\n` alone would hold every stats update back
/// until the process exits.
fn drain_lines(pending: &mut Vec<u8>) -> Vec<String> {
    let mut lines = Vec::new();
    while let Some(pos) = pending.iter().position(|&b| b == b'\r' || b == b'\n') {
        let rest = pending.split_off(pos + 1);
        let mut line = std::mem::replace(pending, rest);
        line.pop();
        if !line.is_empty() {
            lines.push(String::from_utf8_lossy(&line).into_owned());
        }
    }
    lines
}

/// Record one stderr line into the diagnostics tail and, when a sink is
/// attached, push any progress percentage it yields.
fn note_line(
    line: String,
    tail: &mut VecDeque<String>,
    progress: &Option<ProgressSink>,
    estimate: &mut u8,
) {
    if tail.len() == DIAGNOSTIC_TAIL_LINES {
        tail.pop_front();
    }
    if let Some(sink) = progress {
        if let Some(pct) = progress_from_line(&line, sink.input_duration, estimate) {
            // coalescing: a full channel drops the update
            let _ = sink.tx.try_send(pct);
        }
    }
    tail.push_back(line);
}

/// Derive a progress percentage from one ffmpeg stderr line.
///
/// With a known input duration the `time=` stamp maps to an exact
/// percentage; without one, each stats line bumps a coarse estimate. Both
/// cap below 100, which is reserved for the Completed transition.
fn progress_from_line(line: &str, input_duration: Option<f64>, estimate: &mut u8) -> Option<u8> {
    let elapsed = parse_time_stamp(line)?;
    match input_duration {
        Some(duration) => {
            let pct = ((elapsed / duration) * 100.0).clamp(0.0, 99.0) as u8;
            Some(pct)
        }
        None => {
            *estimate = estimate.saturating_add(5).min(95);
            Some(*estimate)
        }
    }
}

/// Parse the `time=HH:MM:SS.cc` stamp from an ffmpeg stats line
fn parse_time_stamp(line: &str) -> Option<f64> {
    let idx = line.find("time=")?;
    let rest = &line[idx + 5..];
    let stamp = rest.split_whitespace().next()?;
    if stamp.starts_with("N/A") {
        return None;
    }
    let mut parts = stamp.split(':');
    let hours: f64 = parts.next()?.parse().ok()?;
    let minutes: f64 = parts.next()?.parse().ok()?;
    let seconds: f64 = parts.next()?.parse().ok()?;
    Some(hours * 3600.0 + minutes * 60.0 + seconds)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hwaccel::detect_from_encoders;

    fn spec() -> ConvertSpec {
        ConvertSpec {
            input: PathBuf::from("/in/clip.webm"),
            output: PathBuf::from("/out/clip.mp4"),
            output_format: "mp4".to_string(),
            quality: "medium".to_string(),
        }
    }

    fn engine_with(caps: HwCaps) -> FfmpegEngine {
        FfmpegEngine::new(PathBuf::from("ffmpeg"), PathBuf::from("ffprobe"), caps)
    }

    #[test]
    fn test_software_args_use_quality_profile() {
        let engine = engine_with(HwCaps::disabled());
        let mut s = spec();
        s.quality = "high".to_string();
        let args = engine.build_convert_args(&s, EncodePath::Software);

        assert!(args.windows(2).any(|w| w[0] == "-c:v" && w[1] == "libx264"));
        assert!(args.windows(2).any(|w| w[0] == "-crf" && w[1] == "18"));
        assert!(args.windows(2).any(|w| w[0] == "-preset" && w[1] == "slow"));
        assert_eq!(args.last().unwrap(), "/out/clip.mp4");
    }

    #[test]
    fn test_hardware_args_follow_capability_record() {
        let caps = detect_from_encoders("h264_nvenc", false);
        let engine = engine_with(caps);
        let args = engine.build_convert_args(&spec(), EncodePath::Hardware);

        // acceleration flags and decoder come before -i
        let i_pos = args.iter().position(|a| a == "-i").unwrap();
        let hw_pos = args.iter().position(|a| a == "-hwaccel").unwrap();
        assert!(hw_pos < i_pos);
        assert!(args.windows(2).any(|w| w[0] == "-c:v" && w[1] == "h264_nvenc"));
        assert!(args.windows(2).any(|w| w[0] == "-cq" && w[1] == "23"));
    }

    #[test]
    fn test_segment_args_reencode_between_timestamps() {
        let args = build_segment_args(
            Path::new("/in/a.mp4"),
            Path::new("/out/a_part1.mp4"),
            12.5,
            30.0,
        );
        // fast seek: -ss precedes -i
        assert_eq!(&args[0], "-ss");
        assert_eq!(&args[1], "12.500");
        assert!(args.windows(2).any(|w| w[0] == "-t" && w[1] == "30.000"));
        assert!(args.windows(2).any(|w| w[0] == "-c:v" && w[1] == "libx264"));
        assert!(!args.windows(2).any(|w| w[0] == "-c" && w[1] == "copy"));
    }

    #[test]
    fn test_quality_params_mapping() {
        assert_eq!(quality_params("low"), (28, "veryfast"));
        assert_eq!(quality_params("medium"), (23, "medium"));
        assert_eq!(quality_params("high"), (18, "slow"));
        assert_eq!(quality_params("whatever"), (23, "medium"));
    }

    #[test]
    fn test_drain_lines_splits_on_carriage_return() {
        let mut pending =
            b"frame= 1 time=00:00:01.00\rframe= 2 time=00:00:02.00\rheader line\r\npartial"
                .to_vec();
        let lines = drain_lines(&mut pending);
        assert_eq!(
            lines,
            vec![
                "frame= 1 time=00:00:01.00",
                "frame= 2 time=00:00:02.00",
                "header line",
            ]
        );
        // the unterminated remainder stays buffered
        assert_eq!(pending, b"partial");

        let more = drain_lines(&mut pending);
        assert!(more.is_empty());
        assert_eq!(pending, b"partial");
    }

    /// A stand-in engine binary that emits stats updates the way ffmpeg
    /// does, carriage-return terminated and spread over the run, must move
    /// the progress channel while the process is alive rather than flushing
    /// one coalesced update at exit.
    #[cfg(unix)]
    #[tokio::test]
    async fn test_stats_updates_stream_during_run() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join("fake-ffmpeg");
        std::fs::write(
            &script,
            "#!/bin/sh\n\
             for i in 1 2 3 4 5; do\n\
               printf 'frame= %d time=00:00:0%d.00 bitrate=1k\\r' \"$i\" \"$i\" >&2\n\
               sleep 0.02\n\
             done\n\
             exit 0\n",
        )
        .unwrap();
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();

        // ffprobe path is bogus on purpose: no known duration, so each
        // stats line bumps the coarse estimate
        let engine = FfmpegEngine::new(
            script,
            dir.path().join("no-such-ffprobe"),
            HwCaps::disabled(),
        );
        let (tx, mut rx) = mpsc::channel(16);
        engine
            .convert(&spec(), EncodePath::Software, tx, CancellationToken::new())
            .await
            .unwrap();

        let mut got = Vec::new();
        while let Ok(pct) = rx.try_recv() {
            got.push(pct);
        }
        // one update per stats line, not a single flush at process exit
        assert_eq!(got, vec![5, 10, 15, 20, 25]);
    }

    #[test]
    fn test_parse_time_stamp() {
        let line = "frame= 120 fps= 30 q=28.0 size= 512kB time=00:01:30.50 bitrate= 46.3kbits/s";
        assert_eq!(parse_time_stamp(line), Some(90.5));
        assert_eq!(parse_time_stamp("no stamp here"), None);
        assert_eq!(parse_time_stamp("time=N/A bitrate=N/A"), None);
    }

    #[test]
    fn test_progress_with_known_duration() {
        let mut est = 0;
        let line = "frame= 1 time=00:00:30.00 bitrate=1k";
        assert_eq!(progress_from_line(line, Some(60.0), &mut est), Some(50));

        // past the declared duration clamps below 100
        let line = "frame= 1 time=00:02:00.00 bitrate=1k";
        assert_eq!(progress_from_line(line, Some(60.0), &mut est), Some(99));
    }

    #[test]
    fn test_progress_without_duration_is_coarse_and_monotonic() {
        let mut est = 0;
        let line = "frame= 1 time=00:00:01.00 bitrate=1k";
        let a = progress_from_line(line, None, &mut est).unwrap();
        let b = progress_from_line(line, None, &mut est).unwrap();
        assert!(b > a);
        for _ in 0..100 {
            progress_from_line(line, None, &mut est);
        }
        assert_eq!(progress_from_line(line, None, &mut est), Some(95));
    }
}
