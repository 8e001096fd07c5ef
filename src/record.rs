//! Frame capture and video assembly. Each run gets a frame directory,
//! armed before the first navigation; after the session closes the frames
//! are stitched into one MP4 with ffmpeg's concat demuxer.

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::config::VideoConfig;
use crate::{Error, Result};

/// 2x2 dark PNG written when a run captured no frames, so a video is
/// still produced (ffmpeg upscales it).
const PLACEHOLDER_PNG: &[u8] = &[
    0x89, 0x50, 0x4e, 0x47, 0x0d, 0x0a, 0x1a, 0x0a, 0x00, 0x00, 0x00, 0x0d, 0x49, 0x48, 0x44,
    0x52, 0x00, 0x00, 0x00, 0x02, 0x00, 0x00, 0x00, 0x02, 0x08, 0x02, 0x00, 0x00, 0x00, 0xfd,
    0xd4, 0x9a, 0x73, 0x00, 0x00, 0x00, 0x0e, 0x49, 0x44, 0x41, 0x54, 0x78, 0x9c, 0x63, 0x90,
    0x03, 0x03, 0x06, 0x08, 0x05, 0x00, 0x09, 0xe6, 0x01, 0x69, 0xd4, 0xf7, 0x81, 0x98, 0x00,
    0x00, 0x00, 0x00, 0x49, 0x45, 0x4e, 0x44, 0xae, 0x42, 0x60, 0x82,
];

/// Per-run frame directory. Created when the session is provisioned,
/// before any navigation, so the first frame of activity is captured.
#[derive(Debug)]
pub struct FrameSink {
    run_id: String,
    dir: PathBuf,
    frames: u32,
}

impl FrameSink {
    /// Create the frame directory for a run.
    pub fn create(root: &Path, run_id: &str) -> Result<Self> {
        let stamp = chrono::Utc::now().format("%Y%m%d_%H%M%S");
        let dir = root.join(format!("{}_{}", stamp, run_id));
        std::fs::create_dir_all(&dir)?;
        Ok(Self {
            run_id: run_id.to_string(),
            dir,
            frames: 0,
        })
    }

    /// Append one PNG frame.
    pub fn push(&mut self, png: &[u8]) -> Result<()> {
        let path = self.dir.join(format!("frame_{:06}.png", self.frames));
        std::fs::write(path, png)?;
        self.frames += 1;
        Ok(())
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn frame_count(&self) -> u32 {
        self.frames
    }
}

/// The finalized recording. Immutable once created.
#[derive(Debug, Clone, Serialize)]
pub struct VideoArtifact {
    /// Path of the encoded file under the artifacts directory.
    pub path: PathBuf,
    /// Frames that went into the video.
    pub frames: u32,
    /// Nominal playback duration in seconds.
    pub duration_secs: f64,
}

impl VideoArtifact {
    /// File name component, for building a serving URL.
    pub fn file_name(&self) -> Option<&str> {
        self.path.file_name().and_then(|n| n.to_str())
    }
}

/// Stitches a closed frame sink into a video artifact. Trait so the run
/// controller can be exercised with a scripted implementation.
#[async_trait]
pub trait Finalizer: Send + Sync {
    async fn finalize(&self, sink: FrameSink) -> Result<VideoArtifact>;
}

/// Real finalizer: ffmpeg concat demuxer, libx264, even 1920x1080 output.
pub struct FfmpegFinalizer {
    artifacts_dir: PathBuf,
    fps: u32,
    encode_timeout: Duration,
}

impl FfmpegFinalizer {
    pub fn new(config: &VideoConfig) -> Self {
        Self {
            artifacts_dir: config.artifacts_dir.clone(),
            fps: config.fps.max(1),
            encode_timeout: Duration::from_secs(config.encode_timeout_secs),
        }
    }

    /// Write the concat list ffmpeg consumes: one entry per frame with its
    /// display duration, last frame repeated so the total duration is known.
    fn write_concat_list(&self, sink: &FrameSink) -> Result<PathBuf> {
        let mut list = String::new();
        let duration = 1.0 / self.fps as f64;
        for i in 0..sink.frame_count() {
            list.push_str(&format!("file 'frame_{:06}.png'\n", i));
            list.push_str(&format!("duration {:.4}\n", duration));
        }
        list.push_str(&format!(
            "file 'frame_{:06}.png'\n",
            sink.frame_count().saturating_sub(1)
        ));
        let path = sink.dir().join("concat.txt");
        std::fs::write(&path, list)?;
        Ok(path)
    }
}

#[async_trait]
impl Finalizer for FfmpegFinalizer {
    async fn finalize(&self, mut sink: FrameSink) -> Result<VideoArtifact> {
        if sink.frame_count() == 0 {
            debug!("no frames captured, writing placeholder");
            sink.push(PLACEHOLDER_PNG)?;
        }

        std::fs::create_dir_all(&self.artifacts_dir)?;
        let concat = self.write_concat_list(&sink)?;
        let output = self.artifacts_dir.join(format!("{}.mp4", sink.run_id()));

        info!(
            "stitching {} frame(s) at {} fps -> {}",
            sink.frame_count(),
            self.fps,
            output.display()
        );

        let mut cmd = Command::new("ffmpeg");
        cmd.arg("-y")
            .args(["-f", "concat", "-safe", "0"])
            .arg("-i")
            .arg(&concat)
            .args([
                "-vf",
                "scale=1920:1080:force_original_aspect_ratio=decrease,\
                 pad=1920:1080:(ow-iw)/2:(oh-ih)/2:color=black,setsar=1",
                "-c:v",
                "libx264",
                "-pix_fmt",
                "yuv420p",
                "-movflags",
                "+faststart",
                "-crf",
                "23",
            ])
            .arg(&output)
            .kill_on_drop(true);

        let result = tokio::time::timeout(self.encode_timeout, cmd.output())
            .await
            .map_err(|_| {
                Error::Encoding(format!(
                    "ffmpeg timed out after {}s",
                    self.encode_timeout.as_secs()
                ))
            })?
            .map_err(|e| Error::Encoding(format!("ffmpeg not runnable: {}", e)))?;

        if !result.status.success() {
            let stderr = String::from_utf8_lossy(&result.stderr);
            let tail: String = stderr
                .lines()
                .rev()
                .take(5)
                .collect::<Vec<_>>()
                .into_iter()
                .rev()
                .collect::<Vec<_>>()
                .join("\n");
            return Err(Error::Encoding(format!("ffmpeg failed: {}", tail)));
        }

        let size = std::fs::metadata(&output).map(|m| m.len()).unwrap_or(0);
        if size == 0 {
            return Err(Error::Encoding("ffmpeg produced an empty file".into()));
        }

        if let Err(e) = std::fs::remove_dir_all(sink.dir()) {
            warn!("could not remove frame dir {}: {}", sink.dir().display(), e);
        }

        Ok(VideoArtifact {
            path: output,
            frames: sink.frame_count(),
            duration_secs: sink.frame_count() as f64 / self.fps as f64,
        })
    }
}
