use async_trait::async_trait;
use serenity::{gateway::ShardManager, model::gateway::GatewayIntents, Client};
use songbird::{SerenityInit, Songbird};
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::{
    commands::Dispatcher,
    session::{DisconnectReason, GatewayConnector, SessionError, SessionEvents},
    MusicBot,
};
use crate::config::Credentials;

const HTTP_UNAUTHORIZED: u16 = 401;

/// Gateway connection backed by a serenity [`Client`].
///
/// Every login builds a fresh client. The voice manager is shared across
/// clients so existing calls survive a reconnect.
pub struct SerenityConnector {
    credentials: Credentials,
    dispatcher: Arc<Dispatcher>,
    songbird: Arc<Songbird>,
    shard_manager: parking_lot::Mutex<Option<Arc<ShardManager>>>,
}

impl SerenityConnector {
    pub fn new(credentials: Credentials, dispatcher: Arc<Dispatcher>) -> Self {
        Self {
            credentials,
            dispatcher,
            songbird: Songbird::serenity(),
            shard_manager: parking_lot::Mutex::new(None),
        }
    }

    fn intents() -> GatewayIntents {
        GatewayIntents::GUILDS
            | GatewayIntents::GUILD_VOICE_STATES
            | GatewayIntents::GUILD_MESSAGES
            | GatewayIntents::DIRECT_MESSAGES
            | GatewayIntents::MESSAGE_CONTENT
    }
}

/// Rejected tokens become [`SessionError::Auth`]; everything else is
/// treated as transient.
fn classify(error: serenity::Error) -> SessionError {
    if let serenity::Error::Http(http) = &error {
        if http.status_code().map(|status| status.as_u16()) == Some(HTTP_UNAUTHORIZED) {
            return SessionError::Auth(error.to_string());
        }
    }
    SessionError::Network(error.to_string())
}

#[async_trait]
impl GatewayConnector for SerenityConnector {
    async fn connect(&self, events: SessionEvents) -> Result<(), SessionError> {
        let token = match &self.credentials {
            Credentials::Token(token) => token.clone(),
            Credentials::Account { email, .. } => {
                return Err(SessionError::Auth(format!(
                    "account login for {email} is not supported by the bot gateway, use a bot token"
                )));
            }
        };

        let handler = MusicBot::new(self.dispatcher.clone(), self.songbird.clone(), events.clone());
        let mut client = Client::builder(&token, Self::intents())
            .event_handler(handler)
            .register_songbird_with(self.songbird.clone())
            .await
            .map_err(classify)?;

        let user = client.http.get_current_user().await.map_err(classify)?;
        info!("🔑 Logged in as {}", user.name);

        *self.shard_manager.lock() = Some(client.shard_manager.clone());

        tokio::spawn(async move {
            let reason = match client.start().await {
                Ok(()) => DisconnectReason::Closed,
                Err(e) => DisconnectReason::LinkLost(e.to_string()),
            };
            debug!("Gateway client exited: {}", reason);
            events.disconnected(reason);
        });

        Ok(())
    }

    async fn disconnect(&self) -> Result<(), SessionError> {
        let shard_manager = self.shard_manager.lock().take();
        match shard_manager {
            Some(manager) => {
                manager.shutdown_all().await;
                info!("👋 Gateway connection closed");
            }
            None => warn!("Disconnect requested without an open gateway connection"),
        }
        Ok(())
    }
}
