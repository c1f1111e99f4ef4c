use std::fmt;
use std::path::Path;

use log::{info, warn};
use serde::Serialize;
use tokio::process::Command;

use crate::error::{Result, ServiceError};

/// Hardware acceleration families the engine knows how to drive
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HwAccelKind {
    None,
    Nvidia,
    Amd,
    Intel,
    VideoToolbox,
}

impl fmt::Display for HwAccelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            HwAccelKind::None => "none",
            HwAccelKind::Nvidia => "nvidia",
            HwAccelKind::Amd => "amd",
            HwAccelKind::Intel => "intel",
            HwAccelKind::VideoToolbox => "videotoolbox",
        };
        f.write_str(name)
    }
}

/// Capability record consumed opaquely by the JobRunner.
///
/// Produced once at startup by [`probe`]; the runner never computes any of
/// this itself, it only selects between the hardware and software paths.
#[derive(Debug, Clone)]
pub struct HwCaps {
    pub enabled: bool,
    pub kind: HwAccelKind,
    /// Hardware decoder (e.g. h264_cuvid); placed before -i when present
    pub decode_codec: Option<String>,
    /// Hardware encoder (e.g. h264_nvenc)
    pub encode_codec: Option<String>,
    /// Acceleration flags that precede the input argument
    pub extra_args: Vec<String>,
    /// Whether a hardware failure may be retried once on the CPU path
    pub allow_fallback: bool,
}

impl HwCaps {
    pub fn disabled() -> Self {
        HwCaps {
            enabled: false,
            kind: HwAccelKind::None,
            decode_codec: None,
            encode_codec: None,
            extra_args: Vec::new(),
            allow_fallback: false,
        }
    }

    fn nvidia() -> Self {
        HwCaps {
            enabled: true,
            kind: HwAccelKind::Nvidia,
            decode_codec: Some("h264_cuvid".to_string()),
            encode_codec: Some("h264_nvenc".to_string()),
            extra_args: vec![
                "-hwaccel".to_string(),
                "cuda".to_string(),
                "-hwaccel_output_format".to_string(),
                "cuda".to_string(),
            ],
            allow_fallback: true,
        }
    }

    fn amd() -> Self {
        HwCaps {
            enabled: true,
            kind: HwAccelKind::Amd,
            // AMF is encode-only
            decode_codec: None,
            encode_codec: Some("h264_amf".to_string()),
            extra_args: Vec::new(),
            allow_fallback: true,
        }
    }

    fn intel() -> Self {
        HwCaps {
            enabled: true,
            kind: HwAccelKind::Intel,
            decode_codec: Some("h264_qsv".to_string()),
            encode_codec: Some("h264_qsv".to_string()),
            extra_args: vec!["-hwaccel".to_string(), "qsv".to_string()],
            allow_fallback: true,
        }
    }

    fn videotoolbox() -> Self {
        HwCaps {
            enabled: true,
            kind: HwAccelKind::VideoToolbox,
            // VideoToolbox decode is selected by -hwaccel alone
            decode_codec: None,
            encode_codec: Some("h264_videotoolbox".to_string()),
            extra_args: vec![
                "-hwaccel".to_string(),
                "videotoolbox".to_string(),
                "-hwaccel_output_format".to_string(),
                "videotoolbox_vld".to_string(),
            ],
            allow_fallback: true,
        }
    }
}

/// Probe ffmpeg for hardware-accelerated encoders and pick the best family.
///
/// Any probe failure degrades to the CPU-only record; the service always
/// starts.
pub async fn probe(ffmpeg_bin: &Path) -> HwCaps {
    let output = Command::new(ffmpeg_bin)
        .arg("-hide_banner")
        .arg("-encoders")
        .output()
        .await;

    let output = match output {
        Ok(out) => out,
        Err(e) => {
            warn!("encoder probe failed, using CPU encoding: {}", e);
            return HwCaps::disabled();
        }
    };

    let mut encoders = String::from_utf8_lossy(&output.stdout).into_owned();
    encoders.push_str(&String::from_utf8_lossy(&output.stderr));

    let caps = detect_from_encoders(&encoders, cfg!(target_os = "macos"));
    match caps.kind {
        HwAccelKind::None => info!("no GPU acceleration detected, using CPU encoding"),
        kind => info!("GPU acceleration detected: {}", kind),
    }
    caps
}

/// Map an `ffmpeg -encoders` listing to a capability record.
///
/// Priority: VideoToolbox (macOS only), then NVENC, AMF, Quick Sync.
pub fn detect_from_encoders(encoders: &str, prefer_videotoolbox: bool) -> HwCaps {
    if prefer_videotoolbox
        && (encoders.contains("h264_videotoolbox") || encoders.contains("hevc_videotoolbox"))
    {
        return HwCaps::videotoolbox();
    }
    if encoders.contains("h264_nvenc") || encoders.contains("hevc_nvenc") {
        return HwCaps::nvidia();
    }
    if encoders.contains("h264_amf") || encoders.contains("hevc_amf") {
        return HwCaps::amd();
    }
    if encoders.contains("h264_qsv") || encoders.contains("hevc_qsv") {
        return HwCaps::intel();
    }
    HwCaps::disabled()
}

/// Encode one second of synthetic video through the detected hardware path.
/// A failure here means the encoder is listed but unusable (no device, no
/// driver); callers should fall back to the CPU-only record.
pub async fn smoke_test(ffmpeg_bin: &Path, caps: &HwCaps) -> Result<()> {
    if !caps.enabled {
        return Ok(());
    }

    let mut args: Vec<String> = vec![
        "-f".to_string(),
        "lavfi".to_string(),
        "-i".to_string(),
        "testsrc=duration=1:size=320x240:rate=1".to_string(),
    ];
    if let Some(encoder) = &caps.encode_codec {
        args.push("-c:v".to_string());
        args.push(encoder.clone());
    }
    args.push("-f".to_string());
    args.push("null".to_string());
    args.push("-".to_string());

    let output = Command::new(ffmpeg_bin).args(&args).output().await?;
    if !output.status.success() {
        return Err(ServiceError::Engine(format!(
            "{} smoke test failed: {}",
            caps.kind,
            String::from_utf8_lossy(&output.stderr)
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_nvenc_detected() {
        let caps = detect_from_encoders("V..... h264_nvenc  NVIDIA NVENC H.264 encoder", false);
        assert!(caps.enabled);
        assert_eq!(caps.kind, HwAccelKind::Nvidia);
        assert_eq!(caps.encode_codec.as_deref(), Some("h264_nvenc"));
        assert!(caps.allow_fallback);
    }

    #[test]
    fn test_videotoolbox_preferred_on_macos() {
        let listing = "V..... h264_nvenc ...\nV..... h264_videotoolbox ...";
        let caps = detect_from_encoders(listing, true);
        assert_eq!(caps.kind, HwAccelKind::VideoToolbox);

        // off macOS the NVENC entry wins
        let caps = detect_from_encoders(listing, false);
        assert_eq!(caps.kind, HwAccelKind::Nvidia);
    }

    #[test]
    fn test_amf_is_encode_only() {
        let caps = detect_from_encoders("V..... h264_amf ...", false);
        assert_eq!(caps.kind, HwAccelKind::Amd);
        assert!(caps.decode_codec.is_none());
    }

    #[test]
    fn test_no_hw_encoders() {
        let caps = detect_from_encoders("V..... libx264 ...", false);
        assert!(!caps.enabled);
        assert_eq!(caps.kind, HwAccelKind::None);
        assert!(!caps.allow_fallback);
    }
}
