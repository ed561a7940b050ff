use serenity::{all::GuildId, async_trait};
use songbird::{Event as VoiceEvent, EventContext, EventHandler as VoiceEventHandler};
use tracing::warn;

/// Logs when the voice driver loses its connection.
pub struct DriverDisconnectLogger {
    pub guild_id: GuildId,
}

#[async_trait]
impl VoiceEventHandler for DriverDisconnectLogger {
    async fn act(&self, ctx: &EventContext<'_>) -> Option<VoiceEvent> {
        if let EventContext::DriverDisconnect(data) = ctx {
            warn!(
                "🔌 Voice driver disconnected in guild {} ({:?}, reason: {:?})",
                self.guild_id, data.kind, data.reason
            );
        }

        None
    }
}
