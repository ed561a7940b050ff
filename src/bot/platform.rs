use async_trait::async_trait;
use serenity::{
    all::{ChannelId, GuildId, MessageId, UserId},
    cache::Cache,
    http::Http,
};
use songbird::{events::CoreEvent, Event as VoiceEvent, Songbird};
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::{commands::CommandError, events::DriverDisconnectLogger};
use crate::audio::{player::AudioOutput, voice::SongbirdOutput};

/// What the command layer needs from the chat platform.
#[async_trait]
pub trait ChatPlatform: Send + Sync {
    async fn send_message(&self, channel_id: ChannelId, text: &str) -> Result<(), CommandError>;

    async fn delete_message(
        &self,
        channel_id: ChannelId,
        message_id: MessageId,
    ) -> Result<(), CommandError>;

    /// Voice channel the user currently sits in, if any.
    async fn author_voice_channel(&self, guild_id: GuildId, user_id: UserId) -> Option<ChannelId>;

    async fn join_voice(
        &self,
        guild_id: GuildId,
        channel_id: ChannelId,
    ) -> Result<Arc<dyn AudioOutput>, CommandError>;

    async fn leave_voice(&self, guild_id: GuildId) -> Result<(), CommandError>;
}

/// Serenity/songbird backed platform.
#[derive(Clone)]
pub struct DiscordPlatform {
    http: Arc<Http>,
    cache: Arc<Cache>,
    songbird: Arc<Songbird>,
}

impl DiscordPlatform {
    pub fn new(http: Arc<Http>, cache: Arc<Cache>, songbird: Arc<Songbird>) -> Self {
        Self {
            http,
            cache,
            songbird,
        }
    }
}

#[async_trait]
impl ChatPlatform for DiscordPlatform {
    async fn send_message(&self, channel_id: ChannelId, text: &str) -> Result<(), CommandError> {
        channel_id
            .say(self.http.as_ref(), text)
            .await
            .map(|_| ())
            .map_err(|e| CommandError::Platform(e.to_string()))
    }

    async fn delete_message(
        &self,
        channel_id: ChannelId,
        message_id: MessageId,
    ) -> Result<(), CommandError> {
        channel_id
            .delete_message(&self.http, message_id)
            .await
            .map_err(|e| CommandError::Platform(e.to_string()))
    }

    async fn author_voice_channel(&self, guild_id: GuildId, user_id: UserId) -> Option<ChannelId> {
        let guild = guild_id.to_guild_cached(&self.cache)?;
        guild
            .voice_states
            .get(&user_id)
            .and_then(|voice_state| voice_state.channel_id)
    }

    async fn join_voice(
        &self,
        guild_id: GuildId,
        channel_id: ChannelId,
    ) -> Result<Arc<dyn AudioOutput>, CommandError> {
        // a call kept from an earlier join already carries the logger
        let fresh = self.songbird.get(guild_id).is_none();
        match self.songbird.join(guild_id, channel_id).await {
            Ok(call) => {
                if fresh {
                    let mut handler = call.lock().await;
                    handler.add_global_event(
                        VoiceEvent::Core(CoreEvent::DriverDisconnect),
                        DriverDisconnectLogger { guild_id },
                    );
                }
                info!("🔊 Joined voice channel {} in guild {}", channel_id, guild_id);
                Ok(Arc::new(SongbirdOutput::new(call)))
            }
            Err(e) => {
                warn!("Could not join voice channel {} in guild {}: {}", channel_id, guild_id, e);
                // drop the half-open call so the next attempt starts clean
                if let Err(e) = self.songbird.remove(guild_id).await {
                    debug!("Nothing to clean up after failed join: {}", e);
                }
                Err(CommandError::Permission(e.to_string()))
            }
        }
    }

    async fn leave_voice(&self, guild_id: GuildId) -> Result<(), CommandError> {
        if self.songbird.get(guild_id).is_none() {
            return Ok(());
        }
        self.songbird
            .remove(guild_id)
            .await
            .map_err(|e| CommandError::Platform(e.to_string()))?;
        info!("👋 Left voice channel in guild {}", guild_id);
        Ok(())
    }
}
