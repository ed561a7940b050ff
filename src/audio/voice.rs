use async_trait::async_trait;
use songbird::{
    input::{cached::Memory, AudioStream, Input, LiveInput},
    tracks::TrackHandle,
    Call, Event, EventContext, EventHandler as VoiceEventHandler, TrackEvent,
};
use std::{sync::Arc, time::Duration};
use symphonia::core::{
    io::{MediaSource, ReadOnlySource},
    probe::Hint,
};
use tokio::sync::Mutex;
use tracing::debug;

use crate::{
    audio::{
        player::{AudioOutput, OutputHandle, TrackEndSignal},
        queue::PlaybackError,
    },
    sources::DecodedStream,
};

/// Songbird voice call used as the audio transport of a guild.
pub struct SongbirdOutput {
    call: Arc<Mutex<Call>>,
}

impl SongbirdOutput {
    pub fn new(call: Arc<Mutex<Call>>) -> Self {
        Self { call }
    }
}

#[async_trait]
impl AudioOutput for SongbirdOutput {
    async fn play(
        &self,
        stream: DecodedStream,
        volume: f32,
        on_end: TrackEndSignal,
    ) -> Result<Box<dyn OutputHandle>, PlaybackError> {
        let input: Input = buffer(stream).await?.into();

        let handle = {
            let mut call = self.call.lock().await;
            call.play_only_input(input)
        };

        handle
            .set_volume(volume)
            .map_err(|e| PlaybackError::Output(e.to_string()))?;

        let end = TrackEndHandler {
            signal: on_end,
        };
        for event in [TrackEvent::End, TrackEvent::Error] {
            handle
                .add_event(Event::Track(event), end.clone())
                .map_err(|e| PlaybackError::Output(format!("could not watch track: {e}")))?;
        }

        Ok(Box::new(SongbirdHandle(handle)))
    }
}

/// Caches the decoder pipe in memory as the mixer reads it, so seeks can
/// go back over audio that was already played.
async fn buffer(stream: DecodedStream) -> Result<Memory, PlaybackError> {
    let mut hint = Hint::new();
    hint.with_extension(stream.format().extension());

    let source: Box<dyn MediaSource> = Box::new(ReadOnlySource::new(stream.into_reader()));
    let live = Input::Live(
        LiveInput::Raw(AudioStream {
            input: source,
            hint: Some(hint),
        }),
        None,
    );

    Memory::new(live)
        .await
        .map_err(|e| PlaybackError::Output(format!("could not buffer audio: {e}")))
}

struct SongbirdHandle(TrackHandle);

#[async_trait]
impl OutputHandle for SongbirdHandle {
    fn pause(&self) -> Result<(), PlaybackError> {
        self.0.pause().map_err(|e| PlaybackError::Output(e.to_string()))
    }

    fn resume(&self) -> Result<(), PlaybackError> {
        self.0.play().map_err(|e| PlaybackError::Output(e.to_string()))
    }

    fn set_volume(&self, volume: f32) -> Result<(), PlaybackError> {
        self.0
            .set_volume(volume)
            .map_err(|e| PlaybackError::Output(e.to_string()))
    }

    async fn seek(&self, position: Duration) -> Result<(), PlaybackError> {
        let reached = self
            .0
            .seek_async(position)
            .await
            .map_err(|e| PlaybackError::Output(format!("seek to {position:?} failed: {e}")))?;
        debug!("Track seeked to {:?}", reached);
        Ok(())
    }

    fn stop(&self) {
        if let Err(e) = self.0.stop() {
            debug!("Track already stopped: {}", e);
        }
    }
}

/// Forwards end and error events of a track to the player.
#[derive(Clone)]
struct TrackEndHandler {
    signal: TrackEndSignal,
}

#[async_trait]
impl VoiceEventHandler for TrackEndHandler {
    async fn act(&self, ctx: &EventContext<'_>) -> Option<Event> {
        if let EventContext::Track(tracks) = ctx {
            for (state, _handle) in tracks.iter() {
                debug!("Track {} ended as {:?}", self.signal.serial(), state.playing);
            }
        }

        self.signal.fire().await;
        None
    }
}
