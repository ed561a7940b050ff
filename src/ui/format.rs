use std::time::Duration;

use crate::audio::{player::Enqueued, queue::QueueStatus};

/// `m:ss`, or `h:mm:ss` once the duration reaches an hour.
pub fn format_duration(duration: Duration) -> String {
    let total_seconds = duration.as_secs();
    let hours = total_seconds / 3600;
    let minutes = (total_seconds % 3600) / 60;
    let seconds = total_seconds % 60;

    if hours > 0 {
        format!("{}:{:02}:{:02}", hours, minutes, seconds)
    } else {
        format!("{}:{:02}", minutes, seconds)
    }
}

/// Compact human form: `1m5s`, `2h`, or `250ms` below one second.
pub fn format_human(duration: Duration) -> String {
    let total_seconds = duration.as_secs();
    if total_seconds == 0 {
        return format!("{}ms", duration.as_millis());
    }

    let parts = [
        (total_seconds / 86_400, "d"),
        ((total_seconds % 86_400) / 3600, "h"),
        ((total_seconds % 3600) / 60, "m"),
        (total_seconds % 60, "s"),
    ];

    parts
        .iter()
        .filter(|(value, _)| *value > 0)
        .map(|(value, unit)| format!("{value}{unit}"))
        .collect()
}

/// Reply to the status command.
pub fn status_message(status: &QueueStatus) -> String {
    let Some(current) = &status.current else {
        return format!("Nothing is playing\nVolume: {}", status.volume_percent);
    };

    let position = match status.total {
        Some(total) => format!(
            "[{} / {}]",
            format_duration(status.elapsed),
            format_duration(total)
        ),
        None => format!("[{}]", format_duration(status.elapsed)),
    };

    let playlist = if status.backlog.is_empty() {
        "-".to_string()
    } else {
        status.backlog.join(", ")
    };

    format!(
        "Status: {}\n{} {} {}\nPlaylist: {}\nVolume: {}",
        if status.paused { "**Paused**" } else { "**Playing**" },
        if status.looping { "Looping:" } else { "Current:" },
        current,
        position,
        playlist,
        status.volume_percent
    )
}

/// Reply to a successful queue command.
pub fn added_message(author: &str, enqueued: &Enqueued) -> String {
    match &enqueued.metadata {
        Some(metadata) => match metadata.duration() {
            Some(duration) => format!(
                "{} added **{}** [{}]",
                author,
                metadata.title,
                format_duration(duration)
            ),
            None => format!("{} added **{}**", author, metadata.title),
        },
        None if enqueued.source.contains("://") => {
            format!("{} added <{}>", author, enqueued.source)
        }
        None => format!("{} added `{}` to the playlist", author, enqueued.source),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{audio::queue::Placement, sources::TrackMetadata};

    #[test]
    fn durations() {
        assert_eq!(format_duration(Duration::from_secs(0)), "0:00");
        assert_eq!(format_duration(Duration::from_secs(65)), "1:05");
        assert_eq!(format_duration(Duration::from_secs(3725)), "1:02:05");
    }

    #[test]
    fn human_durations() {
        assert_eq!(format_human(Duration::from_millis(250)), "250ms");
        assert_eq!(format_human(Duration::from_secs(65)), "1m5s");
        assert_eq!(format_human(Duration::from_secs(7200)), "2h");
        assert_eq!(format_human(Duration::from_secs(90_061)), "1d1h1m1s");
    }

    fn status() -> QueueStatus {
        QueueStatus {
            current: Some("`abc` Song [3:00]".into()),
            elapsed: Duration::from_secs(42),
            total: Some(Duration::from_secs(180)),
            paused: false,
            looping: false,
            volume_percent: 20,
            backlog: vec!["def".into(), "ghi".into()],
        }
    }

    #[test]
    fn status_lists_current_and_backlog() {
        assert_eq!(
            status_message(&status()),
            "Status: **Playing**\nCurrent: `abc` Song [3:00] [0:42 / 3:00]\nPlaylist: def, ghi\nVolume: 20"
        );

        let mut looping = status();
        looping.looping = true;
        looping.paused = true;
        looping.backlog.clear();
        looping.total = None;
        assert_eq!(
            status_message(&looping),
            "Status: **Paused**\nLooping: `abc` Song [3:00] [0:42]\nPlaylist: -\nVolume: 20"
        );
    }

    #[test]
    fn idle_status() {
        let mut idle = status();
        idle.current = None;
        assert_eq!(status_message(&idle), "Nothing is playing\nVolume: 20");
    }

    #[test]
    fn added_messages() {
        let mut enqueued = Enqueued {
            placement: Placement::Started,
            source: "abc".into(),
            metadata: Some(TrackMetadata {
                title: "Song".into(),
                duration_seconds: Some(212),
            }),
        };
        assert_eq!(added_message("user#1", &enqueued), "user#1 added **Song** [3:32]");

        enqueued.metadata = None;
        assert_eq!(added_message("user#1", &enqueued), "user#1 added `abc` to the playlist");

        enqueued.source = "https://example.com/list".into();
        assert_eq!(added_message("user#1", &enqueued), "user#1 added <https://example.com/list>");
    }
}
