//! The external media extraction tool.
//!
//! Builds argument lists for metadata and download invocations and runs
//! them through [`WorkerProcess`]. The tool writes media to stdout; this
//! module never parses media formats.

use std::fmt;
use std::path::{Path, PathBuf};

use thiserror::Error;
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::worker::process::{WorkerCommand, WorkerError, WorkerOutput, WorkerProcess};

/// Video height tiers addressed by the `quality` index.
pub const VIDEO_HEIGHTS: [u32; 8] = [144, 240, 360, 480, 720, 1080, 1440, 2160];

/// Audio bitrate tiers (kbps) addressed by the `quality` index.
pub const AUDIO_BITRATES: [u32; 7] = [64, 96, 128, 160, 192, 256, 320];

/// Hosts whose `list` query parameter is dropped.
const YOUTUBE_HOSTS: [&str; 5] = [
    "youtube.com",
    "www.youtube.com",
    "m.youtube.com",
    "music.youtube.com",
    "youtu.be",
];

#[derive(Debug, Error)]
pub enum ToolError {
    #[error("media tool not found or not executable: {}: {source}", .binary.display())]
    NotFound {
        binary: PathBuf,
        #[source]
        source: which::Error,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MediaKind {
    Video,
    Audio,
}

impl MediaKind {
    /// Parse the wire name (`"video"` / `"audio"`).
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "video" => Some(Self::Video),
            "audio" => Some(Self::Audio),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Video => "video",
            Self::Audio => "audio",
        }
    }

    pub fn content_type(&self) -> &'static str {
        match self {
            Self::Video => "video/x-matroska",
            Self::Audio => "application/octet-stream",
        }
    }

    pub fn filename(&self) -> &'static str {
        match self {
            Self::Video => "video.mkv",
            Self::Audio => "audio.bin",
        }
    }

    fn tiers(&self) -> &'static [u32] {
        match self {
            Self::Video => &VIDEO_HEIGHTS,
            Self::Audio => &AUDIO_BITRATES,
        }
    }

    /// Tier value for a quality index, clamped into the table.
    pub fn tier(&self, quality: i64) -> u32 {
        let tiers = self.tiers();
        let last = tiers.len() - 1;
        let idx = usize::try_from(quality.max(0)).map_or(last, |i| i.min(last));
        tiers[idx]
    }
}

impl fmt::Display for MediaKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A validated download request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadRequest {
    pub url: String,
    pub kind: MediaKind,
    pub quality: i64,
    pub format_note: Option<String>,
}

impl DownloadRequest {
    /// Format selector passed to `-f`. An explicit format note wins over the tier.
    pub fn format_selector(&self) -> String {
        match (self.kind, self.format_note.as_deref()) {
            (MediaKind::Video, Some(note)) => format!("b[format_note={note}]/bv*+ba/b"),
            (MediaKind::Video, None) => {
                let h = self.kind.tier(self.quality);
                format!("b[height<=?{h}]/bv*[height<=?{h}]+ba/b")
            }
            (MediaKind::Audio, Some(note)) => format!("ba[format_note={note}]/ba/bestaudio"),
            (MediaKind::Audio, None) => {
                format!("ba[abr<=?{}]/bestaudio", self.kind.tier(self.quality))
            }
        }
    }
}

/// Drop the `list` parameter from YouTube URLs so a single video is fetched.
/// Anything unparseable or off-host is returned unchanged.
pub fn strip_list_param(raw: &str) -> String {
    let Ok(mut url) = Url::parse(raw) else {
        return raw.to_string();
    };

    let is_youtube = url
        .host_str()
        .map(|host| YOUTUBE_HOSTS.contains(&host.to_ascii_lowercase().as_str()))
        .unwrap_or(false);
    if !is_youtube || !url.query_pairs().any(|(key, _)| key == "list") {
        return raw.to_string();
    }

    let kept: Vec<(String, String)> = url
        .query_pairs()
        .filter(|(key, _)| key != "list")
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect();

    if kept.is_empty() {
        url.set_query(None);
    } else {
        url.query_pairs_mut().clear().extend_pairs(kept);
    }
    url.to_string()
}

/// Locate an executable `binary`. Paths with a separator are checked
/// directly, bare names are searched on `PATH`.
pub fn resolve_binary(binary: &Path) -> Result<PathBuf, ToolError> {
    which::which(binary).map_err(|source| ToolError::NotFound {
        binary: binary.to_path_buf(),
        source,
    })
}

/// Handle to the extraction tool binary.
#[derive(Debug, Clone)]
pub struct MediaTool {
    binary: PathBuf,
    fragments: usize,
}

impl MediaTool {
    /// Resolve the binary once. A missing binary is a startup error.
    pub fn new(binary: &Path, fragments: usize) -> Result<Self, ToolError> {
        let binary = resolve_binary(binary)?;
        tracing::info!(binary = %binary.display(), fragments, "Media tool resolved");
        Ok(Self {
            binary,
            fragments: fragments.max(1),
        })
    }

    pub fn info_command(&self, url: &str) -> WorkerCommand {
        WorkerCommand::new(&self.binary).arg("--dump-json").arg(url)
    }

    pub fn download_args(&self, request: &DownloadRequest) -> Vec<String> {
        let mut args: Vec<String> = vec![
            "--no-part".into(),
            "--no-continue".into(),
            "--concurrent-fragments".into(),
            self.fragments.to_string(),
            "--downloader-args".into(),
            "ffmpeg:-threads=0".into(),
            "-o".into(),
            "-".into(),
        ];
        if request.kind == MediaKind::Video {
            args.push("--merge-output-format".into());
            args.push("mkv".into());
        }
        args.push("-f".into());
        args.push(request.format_selector());
        args.push(request.url.clone());
        args
    }

    pub fn download_command(&self, request: &DownloadRequest) -> WorkerCommand {
        WorkerCommand::new(&self.binary).args(self.download_args(request))
    }

    /// Run a metadata query and return the tool's JSON output.
    pub async fn fetch_info(
        &self,
        url: &str,
        cancel: CancellationToken,
    ) -> Result<Vec<u8>, WorkerError> {
        WorkerProcess::run_to_completion(&self.info_command(url), cancel).await
    }

    /// Start a download whose media bytes arrive on the returned output.
    pub fn start_download(
        &self,
        request: &DownloadRequest,
        cancel: CancellationToken,
    ) -> Result<(WorkerOutput, WorkerProcess), WorkerError> {
        tracing::info!(
            kind = %request.kind,
            quality = request.quality,
            format_note = ?request.format_note,
            "Starting download"
        );
        WorkerProcess::start(&self.download_command(request), cancel)
    }
}
