use std::time::{Duration, Instant};

use crate::{
    sources::{DecodeProcess, DecodedStream, LoadedTrack, TrackMetadata, TrackRequest},
    ui::format::format_duration,
};

/// Elapsed-position marker. Runs only while the track is audible.
#[derive(Debug, Clone, Copy, Default)]
pub struct PlayClock {
    base: Duration,
    since: Option<Instant>,
}

impl PlayClock {
    pub fn start(&mut self, now: Instant) {
        if self.since.is_none() {
            self.since = Some(now);
        }
    }

    pub fn pause(&mut self, now: Instant) {
        if let Some(since) = self.since.take() {
            self.base += now.saturating_duration_since(since);
        }
    }

    pub fn elapsed(&self, now: Instant) -> Duration {
        match self.since {
            Some(since) => self.base + now.saturating_duration_since(since),
            None => self.base,
        }
    }

    /// Moves the marker, keeping the running state.
    pub fn set(&mut self, position: Duration, now: Instant) {
        self.base = position;
        if self.since.is_some() {
            self.since = Some(now);
        }
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

/// One queued or playing unit of audio.
///
/// The decoded stream is taken exactly once by the transport. Dropping the
/// track kills the decode process that feeds it.
#[derive(Debug)]
pub struct Track {
    pub request: TrackRequest,
    pub metadata: Option<TrackMetadata>,
    stream: Option<DecodedStream>,
    process: Option<DecodeProcess>,
    pub clock: PlayClock,
}

impl Track {
    pub fn new(request: TrackRequest, loaded: LoadedTrack, metadata: Option<TrackMetadata>) -> Self {
        Self {
            request,
            metadata,
            stream: Some(loaded.stream),
            process: loaded.process,
            clock: PlayClock::default(),
        }
    }

    /// A track whose stream has to be resolved again before it can play.
    #[cfg(test)]
    pub(crate) fn unloaded(request: TrackRequest, metadata: Option<TrackMetadata>) -> Self {
        Self {
            request,
            metadata,
            stream: None,
            process: None,
            clock: PlayClock::default(),
        }
    }

    pub fn has_stream(&self) -> bool {
        self.stream.is_some()
    }

    pub fn take_stream(&mut self) -> Option<DecodedStream> {
        self.stream.take()
    }

    /// Installs a fresh decode, replacing (and killing) any previous one.
    pub fn attach(&mut self, loaded: LoadedTrack) {
        self.release();
        self.stream = Some(loaded.stream);
        self.process = loaded.process;
    }

    /// Kills the decode process and drops any unread stream.
    pub fn release(&mut self) {
        self.stream = None;
        if let Some(process) = self.process.take() {
            process.terminate();
        }
    }

    /// Clears playback state so the track can be queued again.
    pub fn rewound(mut self) -> Self {
        self.release();
        self.clock.reset();
        self
    }

    pub fn duration(&self) -> Option<Duration> {
        self.metadata.as_ref().and_then(TrackMetadata::duration)
    }

    /// Short human description used in replies and logs.
    pub fn describe(&self) -> String {
        match &self.metadata {
            Some(metadata) => match metadata.duration() {
                Some(duration) => format!(
                    "`{}` {} [{}]",
                    self.request.source,
                    metadata.title,
                    format_duration(duration)
                ),
                None => format!("`{}` {}", self.request.source, metadata.title),
            },
            None => self.request.source.clone(),
        }
    }
}
