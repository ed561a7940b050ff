use futures::future::BoxFuture;
use serenity::all::{ChannelId, GuildId, MessageId, UserId};
use std::{collections::HashMap, str::FromStr, sync::Arc, time::Duration};
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::{handlers, platform::ChatPlatform};
use crate::{
    audio::{
        player::{AudioPlayer, EnqueueError},
        queue::PlaybackError,
    },
    sources::DecodeError,
    ui,
};

/// Command failures. The display text is what the user sees; details go
/// to the log.
#[derive(Debug, Error)]
pub enum CommandError {
    #[error("This command does not work with private messages")]
    PrivateChannel,

    #[error("You have to enter a URL")]
    MissingArgument,

    #[error("Nothing to queue, something happened")]
    NoMediaId,

    #[error("Join a voice channel first")]
    NotInVoice,

    /// The platform refused an operation such as joining voice.
    #[error("Unable to join voice channel")]
    Permission(String),

    #[error("Could not queue audio: {0}")]
    Decode(#[from] DecodeError),

    #[error("{}", playback_message(.0))]
    Playback(#[from] PlaybackError),

    #[error("Something went wrong, try again later")]
    Platform(String),
}

fn playback_message(error: &PlaybackError) -> String {
    match error {
        PlaybackError::NothingPlaying => "Nothing is playing".to_string(),
        PlaybackError::QueueFull(max) => format!("The queue is full ({max} tracks)"),
        PlaybackError::Output(_) => "Playback failed".to_string(),
    }
}

impl CommandError {
    /// Failures after which the command message is cleaned up like a
    /// successful queue.
    fn deletes_request(&self) -> bool {
        matches!(self, Self::NoMediaId | Self::Permission(_))
    }
}

impl From<EnqueueError> for CommandError {
    fn from(error: EnqueueError) -> Self {
        match error {
            EnqueueError::Decode(e) => Self::Decode(e),
            EnqueueError::Playback(e) => Self::Playback(e),
        }
    }
}

/// Malformed numeric argument. Never fatal.
#[derive(Debug, Error, PartialEq, Eq)]
#[error("attempted to parse non-numeric value {input:?}")]
pub struct ParseError {
    pub input: String,
}

pub fn parse_number<T: FromStr>(input: Option<&str>) -> Result<T, ParseError> {
    let input = input.unwrap_or_default();
    input.trim().parse().map_err(|_| ParseError {
        input: input.to_string(),
    })
}

/// Parses `input`, falling back to `default` with a warning.
pub fn parse_or<T: FromStr>(input: Option<&str>, default: T) -> T {
    match parse_number(input) {
        Ok(value) => value,
        Err(e) => {
            warn!("{}, using default", e);
            default
        }
    }
}

/// Where a command came from.
#[derive(Debug, Clone)]
pub struct Origin {
    /// `None` in private channels
    pub guild_id: Option<GuildId>,
    pub channel_id: ChannelId,
    pub message_id: MessageId,
    pub author_id: UserId,
    /// Display name used in replies
    pub author_tag: String,
}

/// Shared services every handler can reach.
#[derive(Clone)]
pub struct CommandContext {
    pub player: Arc<AudioPlayer>,
    pub platform: Arc<dyn ChatPlatform>,
}

/// One parsed command on its way to a handler.
pub struct Invocation {
    pub verb: &'static str,
    pub args: Vec<String>,
    pub origin: Origin,
    pub ctx: CommandContext,
}

impl Invocation {
    pub fn arg(&self, index: usize) -> Option<&str> {
        self.args.get(index).map(String::as_str)
    }

    /// Guild of the command; private channels are rejected.
    pub fn guild(&self) -> Result<GuildId, CommandError> {
        self.origin.guild_id.ok_or(CommandError::PrivateChannel)
    }
}

/// What to send back after a command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    pub text: String,
    /// Delete the command message after the configured delay
    pub delete_request: bool,
}

impl Reply {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            delete_request: false,
        }
    }

    pub fn ok() -> Self {
        Self::text(":ok_hand:")
    }

    pub fn and_delete_request(mut self) -> Self {
        self.delete_request = true;
        self
    }
}

pub type CommandResult = Result<Reply, CommandError>;
pub type CommandHandler = fn(Invocation) -> BoxFuture<'static, CommandResult>;

#[derive(Clone, Copy)]
pub struct CommandSpec {
    pub verb: &'static str,
    pub handler: CommandHandler,
    /// Argument verbs accept trailing words; the others must match exactly.
    pub takes_args: bool,
}

pub struct ParsedCommand {
    pub spec: CommandSpec,
    pub args: Vec<String>,
}

/// Verb to handler table.
#[derive(Default)]
pub struct CommandRegistry {
    commands: HashMap<&'static str, CommandSpec>,
}

impl CommandRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `handler` under every verb in `verbs`; the first one is
    /// the name used in logs.
    pub fn register(&mut self, verbs: &[&'static str], takes_args: bool, handler: CommandHandler) {
        let Some(&name) = verbs.first() else {
            return;
        };
        for verb in verbs {
            self.commands.insert(
                verb,
                CommandSpec {
                    verb: name,
                    handler,
                    takes_args,
                },
            );
        }
    }

    /// The bot's command surface.
    pub fn standard() -> Self {
        let mut registry = Self::new();
        registry.register(&["!queue", "!q"], true, |inv| Box::pin(handlers::queue(inv)));
        registry.register(&["!qx"], true, |inv| Box::pin(handlers::queue_url(inv)));
        registry.register(&["!skip", "!s"], false, |inv| Box::pin(handlers::skip(inv)));
        registry.register(&["!volume", "!v"], true, |inv| Box::pin(handlers::volume(inv)));
        registry.register(&["!status"], false, |inv| Box::pin(handlers::status(inv)));
        registry.register(&["!stop"], false, |inv| Box::pin(handlers::stop(inv)));
        registry.register(&["!pause"], false, |inv| Box::pin(handlers::pause(inv)));
        registry.register(&["!resume"], false, |inv| Box::pin(handlers::resume(inv)));
        registry.register(&["!rewindto"], true, |inv| Box::pin(handlers::rewind_to(inv)));
        registry.register(&["!forwardto"], true, |inv| Box::pin(handlers::forward_to(inv)));
        registry.register(&["!rewind"], true, |inv| Box::pin(handlers::rewind(inv)));
        registry.register(&["!forward"], true, |inv| Box::pin(handlers::forward(inv)));
        registry.register(&["!shuffle"], false, |inv| Box::pin(handlers::shuffle(inv)));
        registry.register(&["!loop"], false, |inv| Box::pin(handlers::toggle_loop(inv)));
        registry
    }

    /// Matches the verb case-insensitively. Arguments keep their case.
    pub fn parse(&self, text: &str) -> Option<ParsedCommand> {
        let mut words = text.split_whitespace();
        let verb = words.next()?.to_lowercase();
        let spec = *self.commands.get(verb.as_str())?;
        let args: Vec<String> = words.map(str::to_string).collect();

        if !spec.takes_args && !args.is_empty() {
            return None;
        }

        Some(ParsedCommand { spec, args })
    }
}

/// Routes chat messages to command handlers.
///
/// Each command runs on its own task under a supervising task that turns
/// the result, an error or a panic into exactly one reply.
pub struct Dispatcher {
    registry: CommandRegistry,
    player: Arc<AudioPlayer>,
    delete_after: Duration,
    message_limit: usize,
}

impl Dispatcher {
    pub fn new(
        registry: CommandRegistry,
        player: Arc<AudioPlayer>,
        delete_after: Duration,
        message_limit: usize,
    ) -> Self {
        Self {
            registry,
            player,
            delete_after,
            message_limit,
        }
    }

    pub fn player(&self) -> &Arc<AudioPlayer> {
        &self.player
    }

    /// Returns immediately. `None` when the text is not a command.
    pub fn on_message(
        &self,
        text: &str,
        origin: Origin,
        platform: Arc<dyn ChatPlatform>,
    ) -> Option<JoinHandle<()>> {
        let ParsedCommand { spec, args } = self.registry.parse(text)?;

        info!(
            "📝 {} used by {} in {}",
            spec.verb,
            origin.author_tag,
            origin
                .guild_id
                .map(|g| format!("guild {g}"))
                .unwrap_or_else(|| "a private channel".to_string())
        );

        let channel_id = origin.channel_id;
        let message_id = origin.message_id;
        let invocation = Invocation {
            verb: spec.verb,
            args,
            origin,
            ctx: CommandContext {
                player: self.player.clone(),
                platform: platform.clone(),
            },
        };
        let delete_after = self.delete_after;
        let limit = self.message_limit;

        Some(tokio::spawn(async move {
            let reply = match tokio::spawn((spec.handler)(invocation)).await {
                Ok(Ok(reply)) => reply,
                Ok(Err(e)) => {
                    warn!("Command {} failed: {:?}", spec.verb, e);
                    Reply {
                        text: e.to_string(),
                        delete_request: e.deletes_request(),
                    }
                }
                Err(e) => {
                    warn!("Command {} crashed: {}", spec.verb, e);
                    Reply::text("Something went wrong, try again later")
                }
            };

            send_reply(platform.as_ref(), channel_id, &reply.text, limit).await;

            if reply.delete_request {
                schedule_delete(platform, channel_id, message_id, delete_after);
            }
        }))
    }
}

/// Sends `text` split into platform-sized chunks.
pub async fn send_reply(platform: &dyn ChatPlatform, channel_id: ChannelId, text: &str, limit: usize) {
    for chunk in ui::split(text, limit) {
        if let Err(e) = platform.send_message(channel_id, &chunk).await {
            warn!("Could not send reply to channel {}: {:?}", channel_id, e);
        }
    }
}

/// Deletes a message after `delay` on a detached task.
pub fn schedule_delete(
    platform: Arc<dyn ChatPlatform>,
    channel_id: ChannelId,
    message_id: MessageId,
    delay: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        tokio::time::sleep(delay).await;
        match platform.delete_message(channel_id, message_id).await {
            Ok(()) => debug!("Deleted command message {}", message_id),
            Err(e) => warn!("Could not delete message {}: {:?}", message_id, e),
        }
    })
}
