use regex::Regex;
use std::sync::LazyLock;

/// Watch URLs (`watch?…v=ID`), short paths (`/v/ID`, `/embed/ID`, `/shorts/ID`)
/// and the `youtu.be/ID` short-link host. The host must start the URL (after
/// an optional scheme), so look-alike domains do not match.
static YOUTUBE_URL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"^(?i:(?:https?://)?(?:(?:www\.|m\.|music\.)?youtube\.com/(?:watch\?(?:[^\s#]*?&)?v=|(?:v|embed|shorts)/)|youtu\.be/))([A-Za-z0-9_-]+)",
    )
    .expect("media id pattern is valid")
});

/// Extracts a normalized media identifier from a video-sharing URL.
///
/// Returns `None` for anything that is not a recognized form; this is not an
/// error, the caller decides what to tell the user.
pub fn extract_media_id(url: &str) -> Option<String> {
    YOUTUBE_URL
        .captures(url.trim())
        .and_then(|caps| caps.get(1))
        .map(|id| id.as_str().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn watch_url_with_extra_params() {
        assert_eq!(
            extract_media_id("https://www.youtube.com/watch?v=abc123&list=xyz"),
            Some("abc123".to_string())
        );
    }

    #[test]
    fn watch_url_with_v_not_first() {
        assert_eq!(
            extract_media_id("https://youtube.com/watch?feature=share&v=dQw4w9WgXcQ"),
            Some("dQw4w9WgXcQ".to_string())
        );
    }

    #[test]
    fn short_link_host() {
        assert_eq!(extract_media_id("https://youtu.be/abc123"), Some("abc123".to_string()));
        assert_eq!(extract_media_id("youtu.be/abc123?t=42"), Some("abc123".to_string()));
    }

    #[test]
    fn short_path_forms() {
        assert_eq!(
            extract_media_id("http://www.youtube.com/v/abc-_1"),
            Some("abc-_1".to_string())
        );
        assert_eq!(
            extract_media_id("https://www.youtube.com/shorts/Zx9"),
            Some("Zx9".to_string())
        );
    }

    #[test]
    fn unrecognized_forms_yield_none() {
        assert_eq!(extract_media_id("https://example.com/not-a-video"), None);
        assert_eq!(extract_media_id("https://www.youtube.com/channel/UC123"), None);
        assert_eq!(extract_media_id("https://www.youtube.com/watch?xv=abc"), None);
        assert_eq!(extract_media_id(""), None);
    }

    #[test]
    fn look_alike_hosts_yield_none() {
        assert_eq!(extract_media_id("https://notyoutube.com/watch?v=abc"), None);
        assert_eq!(extract_media_id("https://evil.example/youtu.be/abc"), None);
        assert_eq!(extract_media_id("https://fakeyoutu.be/abc"), None);
        assert_eq!(extract_media_id("see https://youtu.be/abc"), None);
        assert_eq!(
            extract_media_id("  https://m.youtube.com/watch?v=abc  "),
            Some("abc".to_string())
        );
    }
}
