//! # Sources Module
//!
//! Turns a user supplied reference (a URL or a resolved media id) into a
//! decoded audio stream.
//!
//! The only production source is [`ytdlp::YtDlpLoader`], which runs `yt-dlp`
//! with an `ffmpeg` post-processing step and reads MP3 from the subprocess
//! pipe. The rest of the bot only sees the [`TrackLoader`] trait, so the
//! audio engine can be exercised without spawning processes.
//!
//! ## Stream ownership
//!
//! A [`DecodedStream`] is consumed destructively by exactly one reader. It is
//! not `Clone`; it moves from the loader into the `Track`, and from the
//! `Track` into the voice transport.

pub mod media_id;
pub mod ytdlp;

use async_trait::async_trait;
use serde::{Deserialize, Deserializer};
use std::{fmt, io::Read, time::Duration};
use thiserror::Error;

pub use media_id::extract_media_id;
pub use ytdlp::{DecodeProcess, YtDlpLoader};

/// Errors produced while starting or reading a decode subprocess.
#[derive(Debug, Error)]
pub enum DecodeError {
    /// Executable missing or not startable. Fatal to that enqueue only.
    #[error("could not start {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    /// The subprocess produced nothing that looks like audio.
    #[error("unsupported stream: {0}")]
    UnsupportedStream(String),

    /// Pipe failure after a successful start.
    #[error("decode pipe failed: {0}")]
    Io(#[from] std::io::Error),
}

/// Playlist position hints passed verbatim to the decoder.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PositionHints {
    pub start: Option<String>,
    pub end: Option<String>,
}

impl PositionHints {
    /// Command line flags in insertion order, values untouched.
    pub fn to_args(&self) -> Vec<String> {
        let mut args = Vec::new();
        if let Some(start) = &self.start {
            args.push("--playlist-start".to_string());
            args.push(start.clone());
        }
        if let Some(end) = &self.end {
            args.push("--playlist-end".to_string());
            args.push(end.clone());
        }
        args
    }
}

/// What the user asked for; enough to (re)start the decoder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackRequest {
    /// URL or media id handed to the decoder
    pub source: String,
    /// Resolved media id, when the source was recognized
    pub media_id: Option<String>,
    pub hints: PositionHints,
}

impl TrackRequest {
    /// Request for a recognized media id.
    pub fn media(id: impl Into<String>) -> Self {
        let id = id.into();
        Self {
            source: id.clone(),
            media_id: Some(id),
            hints: PositionHints::default(),
        }
    }

    /// Request for a raw URL (playlists, other hosts).
    pub fn url(url: impl Into<String>, hints: PositionHints) -> Self {
        let url = url.into();
        Self {
            media_id: extract_media_id(&url),
            source: url,
            hints,
        }
    }
}

/// Sidecar metadata written by the decoder (`<id>.info.json`).
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct TrackMetadata {
    pub title: String,
    #[serde(default, rename = "duration", deserialize_with = "seconds")]
    pub duration_seconds: Option<u64>,
}

impl TrackMetadata {
    pub fn duration(&self) -> Option<Duration> {
        self.duration_seconds.map(Duration::from_secs)
    }
}

/// yt-dlp writes integer seconds for most extractors and floats for some.
fn seconds<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<u64>, D::Error> {
    let raw: Option<f64> = Option::deserialize(deserializer)?;
    Ok(raw.filter(|s| s.is_finite() && *s >= 0.0).map(|s| s.round() as u64))
}

/// Container format recognized from the first bytes of the pipe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamFormat {
    Mp3,
    Ogg,
    Flac,
    Wav,
}

impl StreamFormat {
    /// Bytes needed to tell every supported format apart.
    pub const SNIFF_LEN: usize = 12;

    pub fn sniff(prefix: &[u8]) -> Option<Self> {
        match prefix {
            [b'I', b'D', b'3', ..] => Some(Self::Mp3),
            [0xFF, second, ..] if second & 0xE0 == 0xE0 => Some(Self::Mp3),
            [b'O', b'g', b'g', b'S', ..] => Some(Self::Ogg),
            [b'f', b'L', b'a', b'C', ..] => Some(Self::Flac),
            [b'R', b'I', b'F', b'F', _, _, _, _, b'W', b'A', b'V', b'E', ..] => Some(Self::Wav),
            _ => None,
        }
    }

    pub fn extension(&self) -> &'static str {
        match self {
            Self::Mp3 => "mp3",
            Self::Ogg => "ogg",
            Self::Flac => "flac",
            Self::Wav => "wav",
        }
    }
}

/// Move-only decoded byte stream.
pub struct DecodedStream {
    reader: Box<dyn Read + Send + Sync>,
    format: StreamFormat,
}

impl DecodedStream {
    pub fn new(reader: impl Read + Send + Sync + 'static, format: StreamFormat) -> Self {
        Self {
            reader: Box::new(reader),
            format,
        }
    }

    pub fn format(&self) -> StreamFormat {
        self.format
    }

    pub fn into_reader(self) -> Box<dyn Read + Send + Sync> {
        self.reader
    }
}

impl fmt::Debug for DecodedStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DecodedStream")
            .field("format", &self.format)
            .finish_non_exhaustive()
    }
}

/// A started decode: the stream plus the process that feeds it.
#[derive(Debug)]
pub struct LoadedTrack {
    pub stream: DecodedStream,
    pub process: Option<DecodeProcess>,
}

/// Resolves track requests into decoded streams.
#[async_trait]
pub trait TrackLoader: Send + Sync {
    /// Starts decoding. On error nothing is left running.
    async fn load(&self, request: &TrackRequest) -> Result<LoadedTrack, DecodeError>;

    /// Best-effort sidecar metadata; `None` is not an error.
    async fn metadata(&self, media_id: &str) -> Option<TrackMetadata>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sniff_recognizes_supported_headers() {
        assert_eq!(StreamFormat::sniff(b"ID3\x04\x00"), Some(StreamFormat::Mp3));
        assert_eq!(StreamFormat::sniff(&[0xFF, 0xFB, 0x90, 0x64]), Some(StreamFormat::Mp3));
        assert_eq!(StreamFormat::sniff(b"OggS\x00\x02"), Some(StreamFormat::Ogg));
        assert_eq!(StreamFormat::sniff(b"fLaC\x00"), Some(StreamFormat::Flac));
        assert_eq!(StreamFormat::sniff(b"RIFF\x24\x08\x00\x00WAVEfmt "), Some(StreamFormat::Wav));
    }

    #[test]
    fn sniff_rejects_text_and_empty_output() {
        assert_eq!(StreamFormat::sniff(b""), None);
        assert_eq!(StreamFormat::sniff(b"ERROR: Unsupported URL"), None);
        assert_eq!(StreamFormat::sniff(b"<!DOCTYPE html>"), None);
        assert_eq!(StreamFormat::sniff(&[0xFF]), None);
    }

    #[test]
    fn hints_keep_values_verbatim() {
        let hints = PositionHints {
            start: Some("3".into()),
            end: Some("abc".into()),
        };
        assert_eq!(
            hints.to_args(),
            vec!["--playlist-start", "3", "--playlist-end", "abc"]
        );
        assert!(PositionHints::default().to_args().is_empty());
    }

    #[test]
    fn url_request_resolves_media_id() {
        let req = TrackRequest::url("https://youtu.be/abc123", PositionHints::default());
        assert_eq!(req.media_id.as_deref(), Some("abc123"));
        assert_eq!(req.source, "https://youtu.be/abc123");

        let playlist = TrackRequest::url("https://example.com/list", PositionHints::default());
        assert_eq!(playlist.media_id, None);
    }

    #[test]
    fn metadata_accepts_integer_and_float_durations() {
        let int: TrackMetadata =
            serde_json::from_str(r#"{"title":"Song","duration":212,"webpage_url":"https://x"}"#)
                .unwrap();
        assert_eq!(int.duration_seconds, Some(212));

        let float: TrackMetadata =
            serde_json::from_str(r#"{"title":"Song","duration":211.6}"#).unwrap();
        assert_eq!(float.duration_seconds, Some(212));

        let missing: TrackMetadata = serde_json::from_str(r#"{"title":"Live"}"#).unwrap();
        assert_eq!(missing.duration(), None);
    }
}
