use serenity::all::GuildId;
use std::time::Duration;
use tracing::{debug, info, warn};

use super::commands::{parse_or, CommandError, CommandResult, Invocation, Reply};
use crate::{
    audio::queue::SeekOp,
    sources::{extract_media_id, PositionHints, TrackRequest},
    ui::format::{added_message, format_human, status_message},
};

const DEFAULT_VOLUME_PERCENT: i64 = 20;
const DEFAULT_SEEK_MS: i64 = 5000;

/// Joins the author's voice channel unless this guild already has an
/// output attached.
async fn ensure_voice(inv: &Invocation, guild_id: GuildId) -> Result<(), CommandError> {
    let platform = inv.ctx.platform.clone();
    let author_id = inv.origin.author_id;

    inv.ctx
        .player
        .ensure_output(guild_id, || async move {
            let channel_id = platform
                .author_voice_channel(guild_id, author_id)
                .await
                .ok_or(CommandError::NotInVoice)?;
            platform.join_voice(guild_id, channel_id).await
        })
        .await
}

/// `!queue <url>`: queues a recognized video by media id.
pub async fn queue(inv: Invocation) -> CommandResult {
    let guild_id = inv.guild()?;
    let url = inv.arg(0).ok_or(CommandError::MissingArgument)?;

    let Some(media_id) = extract_media_id(url) else {
        debug!("Could not extract a media id from {}", url);
        return Err(CommandError::NoMediaId);
    };

    ensure_voice(&inv, guild_id).await?;

    let enqueued = inv
        .ctx
        .player
        .enqueue(guild_id, TrackRequest::media(media_id))
        .await?;

    Ok(Reply::text(added_message(&inv.origin.author_tag, &enqueued)).and_delete_request())
}

/// `!qx <url> [start] [end]`: queues any URL the decoder accepts,
/// optionally a playlist slice.
pub async fn queue_url(inv: Invocation) -> CommandResult {
    let guild_id = inv.guild()?;
    let url = inv.arg(0).ok_or(CommandError::MissingArgument)?.to_string();
    let hints = PositionHints {
        start: inv.arg(1).map(str::to_string),
        end: inv.arg(2).map(str::to_string),
    };

    ensure_voice(&inv, guild_id).await?;

    debug!("Preparing to queue {} ({:?})", url, hints);
    let enqueued = inv
        .ctx
        .player
        .enqueue(guild_id, TrackRequest::url(url, hints))
        .await?;

    Ok(Reply::text(added_message(&inv.origin.author_tag, &enqueued)).and_delete_request())
}

pub async fn skip(inv: Invocation) -> CommandResult {
    let guild_id = inv.guild()?;
    let skipped = inv.ctx.player.skip(guild_id).await?;
    info!("⏭️ Skipped {} in guild {}", skipped, guild_id);
    Ok(Reply::ok())
}

/// `!volume <0-100>`
pub async fn volume(inv: Invocation) -> CommandResult {
    let guild_id = inv.guild()?;
    let percent = parse_or(inv.arg(0), DEFAULT_VOLUME_PERCENT).clamp(0, 100);

    debug!("Setting volume to {}% in guild {}", percent, guild_id);
    inv.ctx
        .player
        .set_volume(guild_id, percent as f32 / 100.0)
        .await;
    Ok(Reply::ok())
}

pub async fn status(inv: Invocation) -> CommandResult {
    let guild_id = inv.guild()?;
    let status = inv.ctx.player.status(guild_id).await;
    Ok(Reply::text(status_message(&status)))
}

/// Clears the queue and leaves voice.
pub async fn stop(inv: Invocation) -> CommandResult {
    let guild_id = inv.guild()?;
    inv.ctx.player.stop(guild_id).await;
    if let Err(e) = inv.ctx.platform.leave_voice(guild_id).await {
        warn!("Could not leave voice in guild {}: {:?}", guild_id, e);
    }
    Ok(Reply::ok())
}

pub async fn pause(inv: Invocation) -> CommandResult {
    let guild_id = inv.guild()?;
    inv.ctx.player.set_paused(guild_id, true).await;
    Ok(Reply::ok())
}

pub async fn resume(inv: Invocation) -> CommandResult {
    let guild_id = inv.guild()?;
    inv.ctx.player.set_paused(guild_id, false).await;
    Ok(Reply::ok())
}

fn seek_millis(inv: &Invocation) -> u64 {
    parse_or(inv.arg(0), DEFAULT_SEEK_MS).max(0) as u64
}

async fn seek(inv: Invocation, op: SeekOp, prefix: &'static str, ms: u64) -> CommandResult {
    let guild_id = inv.guild()?;
    inv.ctx.player.seek(guild_id, op).await?;
    Ok(Reply::text(format!(
        "{} {}",
        prefix,
        format_human(Duration::from_millis(ms))
    )))
}

pub async fn rewind_to(inv: Invocation) -> CommandResult {
    let ms = seek_millis(&inv);
    seek(inv, SeekOp::RewindTo(ms), ":rewind: to", ms).await
}

pub async fn forward_to(inv: Invocation) -> CommandResult {
    let ms = seek_millis(&inv);
    seek(inv, SeekOp::ForwardTo(ms), ":fast_forward: to", ms).await
}

pub async fn rewind(inv: Invocation) -> CommandResult {
    let ms = seek_millis(&inv);
    seek(inv, SeekOp::Rewind(ms), ":rewind: by", ms).await
}

pub async fn forward(inv: Invocation) -> CommandResult {
    let ms = seek_millis(&inv);
    seek(inv, SeekOp::Forward(ms), ":fast_forward: by", ms).await
}

pub async fn shuffle(inv: Invocation) -> CommandResult {
    let guild_id = inv.guild()?;
    inv.ctx.player.shuffle(guild_id).await;
    Ok(Reply::ok())
}

pub async fn toggle_loop(inv: Invocation) -> CommandResult {
    let guild_id = inv.guild()?;
    let looping = inv.ctx.player.toggle_loop(guild_id).await;
    Ok(Reply::text(format!(
        "Loop mode: {}",
        if looping { "ON" } else { "OFF" }
    )))
}
