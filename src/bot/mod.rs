//! # Bot Module
//!
//! Discord side of the bot.
//!
//! - [`session`]: login, reconnect after link loss and shutdown
//! - [`gateway`]: the serenity client behind the session
//! - [`commands`]: `!`-prefixed text commands, parsed and dispatched off
//!   the event path
//! - [`handlers`]: one function per command
//! - [`platform`]: sending and deleting messages, joining voice
//!
//! ## Architecture
//!
//! [`MusicBot`] implements serenity's [`EventHandler`]. It forwards chat
//! messages to the [`Dispatcher`](commands::Dispatcher), reports link
//! changes to the session and stops playback when the bot is removed from
//! a voice channel. [`maintenance_tasks`] evicts idle playback contexts
//! and expired metadata in the background.

use serenity::{
    all::{ConnectionStage, Context, EventHandler, Message, Ready, ShardStageUpdateEvent, VoiceState},
    async_trait,
};
use songbird::Songbird;
use std::{sync::Arc, time::Duration};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub mod commands;
pub mod events;
pub mod gateway;
pub mod handlers;
pub mod platform;
pub mod session;

use crate::{
    audio::player::AudioPlayer,
    bot::{
        commands::{Dispatcher, Origin},
        platform::DiscordPlatform,
        session::{DisconnectReason, SessionEvents},
    },
    cache::MetadataCache,
    sources::YtDlpLoader,
};

/// Serenity event handler.
pub struct MusicBot {
    dispatcher: Arc<Dispatcher>,
    songbird: Arc<Songbird>,
    events: SessionEvents,
}

impl MusicBot {
    pub fn new(dispatcher: Arc<Dispatcher>, songbird: Arc<Songbird>, events: SessionEvents) -> Self {
        Self {
            dispatcher,
            songbird,
            events,
        }
    }
}

#[async_trait]
impl EventHandler for MusicBot {
    async fn ready(&self, _ctx: Context, ready: Ready) {
        info!("🤖 {} is online!", ready.user.name);
        info!("📊 Connected to {} guilds", ready.guilds.len());
        self.events.ready();
    }

    /// Never awaits a command; the dispatcher runs it on its own task.
    async fn message(&self, ctx: Context, msg: Message) {
        if msg.author.bot {
            return;
        }

        let origin = Origin {
            guild_id: msg.guild_id,
            channel_id: msg.channel_id,
            message_id: msg.id,
            author_id: msg.author.id,
            author_tag: msg.author.tag(),
        };
        let platform = Arc::new(DiscordPlatform::new(
            ctx.http.clone(),
            ctx.cache.clone(),
            self.songbird.clone(),
        ));

        self.dispatcher.on_message(&msg.content, origin, platform);
    }

    async fn shard_stage_update(&self, _ctx: Context, event: ShardStageUpdateEvent) {
        debug!("Shard {} stage {:?} -> {:?}", event.shard_id.0, event.old, event.new);
        match event.new {
            ConnectionStage::Connecting
            | ConnectionStage::Resuming
            | ConnectionStage::Disconnected => {
                self.events.disconnected(DisconnectReason::Reconnecting);
            }
            _ => {}
        }
    }

    /// Stops playback when the bot itself is removed from voice.
    async fn voice_state_update(&self, ctx: Context, old: Option<VoiceState>, new: VoiceState) {
        let current_user_id = ctx.cache.current_user().id;
        if new.user_id != current_user_id || old.is_none() || new.channel_id.is_some() {
            return;
        }

        if let Some(guild_id) = new.guild_id {
            info!("🔌 Disconnected from voice in guild {}", guild_id);
            self.dispatcher.player().stop(guild_id).await;
        }
    }
}

/// Periodic housekeeping until `exit` is cancelled: drops idle playback
/// contexts, expired metadata and checks that the decoder binaries are
/// still installed.
pub async fn maintenance_tasks(
    player: Arc<AudioPlayer>,
    cache: MetadataCache,
    loader: Arc<YtDlpLoader>,
    every: Duration,
    idle_timeout: Duration,
    exit: CancellationToken,
) {
    let mut interval = tokio::time::interval(every);
    // the first tick completes immediately
    interval.tick().await;

    loop {
        tokio::select! {
            _ = exit.cancelled() => break,
            _ = interval.tick() => {}
        }

        let evicted = player.evict_idle(idle_timeout);
        if evicted > 0 {
            info!("🧹 Evicted {} idle playback contexts", evicted);
        }

        cache.cleanup_old_entries();

        if let Err(e) = loader.verify_dependencies().await {
            warn!("Dependency check failed: {:?}", e);
        }

        debug!(
            "🧹 Maintenance done ({} playback contexts, {} cached entries)",
            player.guild_count(),
            cache.len()
        );
    }
}
