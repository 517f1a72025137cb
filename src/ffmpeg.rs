//! Muxing support using ffmpeg as a subprocess.
//!
//! The download pipeline only depends on the [`Muxer`] trait, so that the external utility can be
//! replaced (or mocked in tests) without touching the fetching code.

use std::path::Path;
use std::process::Command;
use tracing::{debug, info};
use crate::VodgrabError;


/// Combines one video stream file and one audio stream file into a single container file at
/// `output`. Implementations are trusted to produce a correctly interleaved container.
pub trait Muxer: Send + Sync {
    fn combine(&self, video: &Path, audio: &Path, output: &Path) -> Result<(), VodgrabError>;
}


/// Runs `ffmpeg` once, copying both elementary streams without reencoding. The container type is
/// chosen by ffmpeg from the extension of the output path.
#[derive(Debug, Clone)]
pub struct FfmpegMuxer {
    location: String,
}

impl Default for FfmpegMuxer {
    fn default() -> Self {
        FfmpegMuxer {
            location: if cfg!(target_os = "windows") {
                String::from("ffmpeg.exe")
            } else {
                String::from("ffmpeg")
            },
        }
    }
}

impl FfmpegMuxer {
    /// Use the ffmpeg binary at `location` instead of looking it up in PATH.
    pub fn with_location(location: &str) -> FfmpegMuxer {
        FfmpegMuxer { location: location.to_string() }
    }
}

impl Muxer for FfmpegMuxer {
    #[tracing::instrument(level = "trace", skip(self))]
    fn combine(&self, video: &Path, audio: &Path, output: &Path) -> Result<(), VodgrabError> {
        info!("Muxing audio and video streams with {}", self.location);
        let ffmpeg = Command::new(&self.location)
            .args(["-hide_banner", "-nostats", "-nostdin",
                   "-loglevel", "error",
                   "-y",  // overwrite output file if it exists
                   "-i"])
            .arg(video)
            .arg("-i")
            .arg(audio)
            .args(["-map", "0:v:0", "-map", "1:a:0",
                   "-c", "copy"])
            .arg(output)
            .output()
            .map_err(|e| VodgrabError::Muxing {
                status: None,
                diagnostics: format!("couldn't run {}: {e}", self.location),
            })?;
        let stderr = String::from_utf8_lossy(&ffmpeg.stderr);
        if ffmpeg.status.success() {
            if !stderr.trim().is_empty() {
                debug!("ffmpeg stderr: {stderr}");
            }
            Ok(())
        } else {
            Err(VodgrabError::Muxing {
                status: ffmpeg.status.code(),
                diagnostics: stderr.trim().to_string(),
            })
        }
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_binary() {
        let muxer = FfmpegMuxer::with_location("/nonexistent/vodgrab-ffmpeg");
        let err = muxer.combine(Path::new("v.mp4"), Path::new("a.mp4"), Path::new("out.mp4"))
            .unwrap_err();
        assert!(matches!(err, VodgrabError::Muxing { status: None, .. }), "unexpected error {err}");
    }

    #[cfg(unix)]
    #[test]
    fn test_failing_binary_reports_status() {
        // `false` ignores its arguments and exits with status 1
        let muxer = FfmpegMuxer::with_location("false");
        let err = muxer.combine(Path::new("v.mp4"), Path::new("a.mp4"), Path::new("out.mp4"))
            .unwrap_err();
        assert!(matches!(err, VodgrabError::Muxing { status: Some(1), .. }), "unexpected error {err}");
    }
}
