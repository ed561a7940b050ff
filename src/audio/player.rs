use async_trait::async_trait;
use dashmap::DashMap;
use serenity::model::id::GuildId;
use std::{
    future::Future,
    sync::{Arc, Weak},
    time::{Duration, Instant},
};
use thiserror::Error;
use tokio::sync::{mpsc, Mutex, OwnedMutexGuard};
use tracing::{debug, info, warn};

use crate::{
    audio::{
        queue::{PlaybackError, PlaybackNotice, PlaybackQueue, Placement, QueueStatus, SeekOp},
        track::Track,
    },
    sources::{DecodeError, DecodedStream, TrackLoader, TrackMetadata, TrackRequest},
};

/// Outbound audio transport of one guild (a joined voice call).
#[async_trait]
pub trait AudioOutput: Send + Sync {
    /// Starts playing `stream`, replacing whatever the transport played
    /// before. `on_end` must be fired when the track ends or errors.
    async fn play(
        &self,
        stream: DecodedStream,
        volume: f32,
        on_end: TrackEndSignal,
    ) -> Result<Box<dyn OutputHandle>, PlaybackError>;
}

/// Controls for the track the transport is currently playing.
#[async_trait]
pub trait OutputHandle: Send + Sync {
    fn pause(&self) -> Result<(), PlaybackError>;
    fn resume(&self) -> Result<(), PlaybackError>;
    fn set_volume(&self, volume: f32) -> Result<(), PlaybackError>;
    /// Resolves once the transport has moved to `position`.
    async fn seek(&self, position: Duration) -> Result<(), PlaybackError>;
    fn stop(&self);
}

/// Reports the end of one play back to the player.
#[derive(Clone)]
pub struct TrackEndSignal {
    player: Weak<AudioPlayer>,
    guild_id: GuildId,
    serial: u64,
}

impl TrackEndSignal {
    pub async fn fire(&self) {
        if let Some(player) = self.player.upgrade() {
            player.track_ended(self.guild_id, self.serial).await;
        }
    }

    pub fn serial(&self) -> u64 {
        self.serial
    }
}

#[derive(Debug, Error)]
pub enum EnqueueError {
    #[error(transparent)]
    Decode(#[from] DecodeError),
    #[error(transparent)]
    Playback(#[from] PlaybackError),
}

/// Result of a successful enqueue, for the reply.
#[derive(Debug, Clone)]
pub struct Enqueued {
    pub placement: Placement,
    pub source: String,
    pub metadata: Option<TrackMetadata>,
}

/// Per-guild playback context: the queue plus its transport.
pub struct GuildPlayer {
    queue: PlaybackQueue,
    output: Option<Arc<dyn AudioOutput>>,
    playing: Option<Box<dyn OutputHandle>>,
    last_active: Instant,
}

impl GuildPlayer {
    fn new(volume: f32, max_queue_size: usize) -> Self {
        Self {
            queue: PlaybackQueue::new(volume, max_queue_size),
            output: None,
            playing: None,
            last_active: Instant::now(),
        }
    }

    fn touch(&mut self) {
        self.last_active = Instant::now();
    }

    fn stop_playing(&mut self) {
        if let Some(handle) = self.playing.take() {
            handle.stop();
        }
    }
}

/// Registry of playback contexts, one per guild.
///
/// Every mutation of a context happens under its own mutex, so commands for
/// one guild serialize while different guilds run in parallel.
pub struct AudioPlayer {
    me: Weak<AudioPlayer>,
    guilds: DashMap<GuildId, Arc<Mutex<GuildPlayer>>>,
    loader: Arc<dyn TrackLoader>,
    default_volume: f32,
    max_queue_size: usize,
    notices: mpsc::UnboundedSender<(GuildId, PlaybackNotice)>,
}

impl AudioPlayer {
    pub fn new(
        loader: Arc<dyn TrackLoader>,
        default_volume: f32,
        max_queue_size: usize,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<(GuildId, PlaybackNotice)>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let player = Arc::new_cyclic(|me| Self {
            me: me.clone(),
            guilds: DashMap::new(),
            loader,
            default_volume,
            max_queue_size,
            notices: tx,
        });
        (player, rx)
    }

    /// Binds the transport produced by `connect` unless the guild already
    /// has one, then starts the current track. `connect` runs under the
    /// guild lock, so concurrent callers connect at most once.
    pub async fn ensure_output<F, Fut, E>(&self, guild_id: GuildId, connect: F) -> Result<(), E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Arc<dyn AudioOutput>, E>>,
    {
        let mut gp = self.lock_context(guild_id).await;
        if gp.output.is_some() {
            return Ok(());
        }
        let output = connect().await?;
        self.bind_output(guild_id, &mut gp, output).await;
        Ok(())
    }

    /// Resolves the request through the loader and queues the track.
    pub async fn enqueue(
        &self,
        guild_id: GuildId,
        request: TrackRequest,
    ) -> Result<Enqueued, EnqueueError> {
        let loaded = self.loader.load(&request).await?;
        let metadata = match &request.media_id {
            Some(id) => self.loader.metadata(id).await,
            None => None,
        };

        let source = request.source.clone();
        let track = Track::new(request, loaded, metadata.clone());

        let mut gp = self.lock_context(guild_id).await;
        gp.touch();

        let placement = match gp.queue.enqueue(track) {
            Ok(placement) => placement,
            Err(e) => {
                self.flush(guild_id, &mut gp.queue);
                return Err(e.into());
            }
        };

        if placement == Placement::Started {
            self.start_current(guild_id, &mut gp).await;
        }
        self.flush(guild_id, &mut gp.queue);

        Ok(Enqueued {
            placement,
            source,
            metadata,
        })
    }

    /// Skips the current track. Returns the description of the skipped one.
    pub async fn skip(&self, guild_id: GuildId) -> Result<String, PlaybackError> {
        let mut gp = self.lock_context(guild_id).await;
        gp.touch();

        let skipped = gp.queue.skip();
        if skipped.is_ok() {
            gp.stop_playing();
            self.start_current(guild_id, &mut gp).await;
        }
        self.flush(guild_id, &mut gp.queue);

        skipped.map(|track| track.describe())
    }

    pub async fn set_paused(&self, guild_id: GuildId, paused: bool) -> bool {
        let mut gp = self.lock_context(guild_id).await;
        gp.touch();

        let changed = gp.queue.set_paused(paused, Instant::now());
        if changed {
            if let Some(handle) = &gp.playing {
                let result = if paused { handle.pause() } else { handle.resume() };
                if let Err(e) = result {
                    warn!("Could not change pause state in guild {}: {}", guild_id, e);
                }
            }
        }
        self.flush(guild_id, &mut gp.queue);
        changed
    }

    /// Clamps and applies the volume. Returns the effective value.
    pub async fn set_volume(&self, guild_id: GuildId, volume: f32) -> f32 {
        let mut gp = self.lock_context(guild_id).await;
        gp.touch();

        let effective = gp.queue.set_volume(volume);
        if let Some(handle) = &gp.playing {
            if let Err(e) = handle.set_volume(effective) {
                warn!("Could not apply volume in guild {}: {}", guild_id, e);
            }
        }
        self.flush(guild_id, &mut gp.queue);
        effective
    }

    pub async fn seek(&self, guild_id: GuildId, op: SeekOp) -> Result<Duration, PlaybackError> {
        let mut gp = self.lock_context(guild_id).await;
        gp.touch();

        let position = gp.queue.seek_target(op, Instant::now())?;
        if let Some(handle) = &gp.playing {
            if let Err(e) = handle.seek(position).await {
                warn!("Could not seek in guild {}: {}", guild_id, e);
                return Err(e);
            }
        }
        gp.queue.commit_seek(position, Instant::now())?;
        debug!("⏩ Guild {} seeked to {:?}", guild_id, position);
        Ok(position)
    }

    /// Flips loop mode and returns the new state.
    pub async fn toggle_loop(&self, guild_id: GuildId) -> bool {
        let mut gp = self.lock_context(guild_id).await;
        gp.touch();

        let looping = gp.queue.toggle_loop();
        self.flush(guild_id, &mut gp.queue);
        looping
    }

    pub async fn shuffle(&self, guild_id: GuildId) -> usize {
        let mut gp = self.lock_context(guild_id).await;
        gp.touch();

        let tracks = gp.queue.shuffle();
        self.flush(guild_id, &mut gp.queue);
        tracks
    }

    pub async fn status(&self, guild_id: GuildId) -> QueueStatus {
        let gp = self.lock_context(guild_id).await;
        gp.queue.status(Instant::now())
    }

    /// Clears the queue, stops the transport and forgets it.
    pub async fn stop(&self, guild_id: GuildId) -> usize {
        let Some(mut gp) = self.lock_existing(guild_id).await else {
            return 0;
        };
        gp.touch();

        gp.stop_playing();
        let dropped = gp.queue.clear();
        gp.output = None;
        self.flush(guild_id, &mut gp.queue);

        info!("⏹️ Playback stopped in guild {} ({} tracks dropped)", guild_id, dropped);
        dropped
    }

    /// Called by the transport when the play with `serial` ended.
    pub async fn track_ended(&self, guild_id: GuildId, serial: u64) {
        let Some(mut gp) = self.lock_existing(guild_id).await else {
            return;
        };

        if !gp.queue.finish(serial) {
            debug!("Ignoring stale end event {} in guild {}", serial, guild_id);
            return;
        }

        gp.touch();
        gp.playing = None;
        self.start_current(guild_id, &mut gp).await;
        self.flush(guild_id, &mut gp.queue);
    }

    /// Drops contexts that have been idle for longer than `max_idle`.
    /// Contexts locked by a running command are skipped; a command that
    /// fetched a context before it was dropped retries on a fresh one (see
    /// [`lock_context`](Self::lock_context)).
    pub fn evict_idle(&self, max_idle: Duration) -> usize {
        let before = self.guilds.len();
        self.guilds.retain(|guild_id, context| match context.try_lock() {
            Ok(gp) => {
                let idle = gp.queue.is_idle()
                    && gp.playing.is_none()
                    && gp.last_active.elapsed() >= max_idle;
                if idle {
                    debug!("Evicting idle playback context for guild {}", guild_id);
                }
                !idle
            }
            Err(_) => true,
        });
        before.saturating_sub(self.guilds.len())
    }

    pub fn guild_count(&self) -> usize {
        self.guilds.len()
    }

    /// Plays the current track, resolving it again if its stream was used.
    /// Tracks that cannot be played are discarded and the next one is tried.
    async fn start_current(&self, guild_id: GuildId, gp: &mut GuildPlayer) {
        loop {
            let Some(output) = gp.output.clone() else {
                return;
            };
            let Some(serial) = gp.queue.current_serial() else {
                return;
            };
            let Some(current) = gp.queue.current_mut() else {
                return;
            };

            if !current.has_stream() {
                let request = current.request.clone();
                match self.loader.load(&request).await {
                    Ok(loaded) => current.attach(loaded),
                    Err(e) => {
                        warn!("Could not reload {} in guild {}: {}", request.source, guild_id, e);
                        gp.queue.discard_current();
                        continue;
                    }
                }
            }

            let Some(stream) = current.take_stream() else {
                gp.queue.discard_current();
                continue;
            };
            let description = current.describe();

            let signal = TrackEndSignal {
                player: self.me.clone(),
                guild_id,
                serial,
            };

            match output.play(stream, gp.queue.volume(), signal).await {
                Ok(handle) => {
                    if gp.queue.is_paused() {
                        if let Err(e) = handle.pause() {
                            warn!("Could not pause new track in guild {}: {}", guild_id, e);
                        }
                    }
                    gp.playing = Some(handle);
                    gp.queue.mark_playing(Instant::now());
                    info!("🎵 Now playing in guild {}: {}", guild_id, description);
                    return;
                }
                Err(e) => {
                    warn!("Could not play {} in guild {}: {}", description, guild_id, e);
                    gp.queue.discard_current();
                }
            }
        }
    }

    /// Starts the current track if it is not playing yet.
    async fn bind_output(&self, guild_id: GuildId, gp: &mut GuildPlayer, output: Arc<dyn AudioOutput>) {
        gp.output = Some(output);
        gp.touch();
        if gp.playing.is_none() {
            self.start_current(guild_id, gp).await;
        }
        self.flush(guild_id, &mut gp.queue);
    }

    fn flush(&self, guild_id: GuildId, queue: &mut PlaybackQueue) {
        for notice in queue.take_notices() {
            // Receiver only goes away at shutdown
            let _ = self.notices.send((guild_id, notice));
        }
    }

    fn get_or_create(&self, guild_id: GuildId) -> Arc<Mutex<GuildPlayer>> {
        self.guilds
            .entry(guild_id)
            .or_insert_with(|| {
                Arc::new(Mutex::new(GuildPlayer::new(
                    self.default_volume,
                    self.max_queue_size,
                )))
            })
            .clone()
    }

    /// Locks the guild's context, retrying when eviction removed the one
    /// fetched from the map before the lock was acquired.
    async fn lock_context(&self, guild_id: GuildId) -> OwnedMutexGuard<GuildPlayer> {
        loop {
            let context = self.get_or_create(guild_id);
            let gp = context.clone().lock_owned().await;
            if self.is_registered(guild_id, &context) {
                return gp;
            }
            debug!("Playback context for guild {} was evicted, retrying", guild_id);
        }
    }

    async fn lock_existing(&self, guild_id: GuildId) -> Option<OwnedMutexGuard<GuildPlayer>> {
        loop {
            let context = self.guilds.get(&guild_id).map(|c| c.clone())?;
            let gp = context.clone().lock_owned().await;
            if self.is_registered(guild_id, &context) {
                return Some(gp);
            }
        }
    }

    fn is_registered(&self, guild_id: GuildId, context: &Arc<Mutex<GuildPlayer>>) -> bool {
        self.guilds
            .get(&guild_id)
            .is_some_and(|current| Arc::ptr_eq(&current, context))
    }
}

/// Logs lifecycle notices until every player is gone.
pub async fn log_notices(mut notices: mpsc::UnboundedReceiver<(GuildId, PlaybackNotice)>) {
    while let Some((guild_id, notice)) = notices.recv().await {
        debug!("🎧 [{}] {}", guild_id, notice);
    }
}
