use std::collections::HashSet;

use once_cell::sync::Lazy;
use url::Url;

/// Twitch static emote CDN. The path template is
/// `<id>/<format>/<theme>/<scale>`.
const TWITCH_CDN_BASE: &str = "https://static-cdn.jtvnw.net/emoticons/v2/";

/// Twemoji bitmap mirror, keyed by dash-joined lowercase hex code points.
const EMOJI_CDN_BASE: &str =
    "https://cdn.jsdelivr.net/gh/toine512/twemoji-bitmaps@main/128x128_png32/";

/// Emote ids that are never displayed, regardless of CLI configuration.
/// These are oversized multi-part emotes that render badly on the panel.
pub static BUILTIN_FORBIDDEN_EMOTES: Lazy<HashSet<String>> = Lazy::new(|| {
    [
        ("MercyWing1", "1003187"),
        ("MercyWing2", "1003189"),
        ("PowerUpL", "425688"),
        ("PowerUpR", "425671"),
        ("Squid1", "191762"),
        ("Squid2", "191763"),
        ("Squid4", "191767"),
        ("DinoDance", "emotesv2_dcd06b30a5c24f6eb871e8f5edbd44f7"),
    ]
    .iter()
    .map(|(_, id)| (*id).to_string())
    .collect()
});

/// Names of the built-in forbidden emotes, for `--help` output.
pub const BUILTIN_FORBIDDEN_NAMES: &[&str] = &[
    "MercyWing1",
    "MercyWing2",
    "PowerUpL",
    "PowerUpR",
    "Squid1",
    "Squid2",
    "Squid4",
    "DinoDance",
];

/// One addressable image: either a Twitch emote or a Unicode emoji.
///
/// Equality is structural; two keys compare equal exactly when they resolve
/// to the same cached file. Twitch emotes always render with the dark theme
/// at 3.0 scale, animated when the emote has an animated variant, so those
/// parameters live in the URL derivation rather than the key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ImageKey {
    TwitchEmote { id: String },
    Emoji { codepoints: Vec<u32> },
}

impl ImageKey {
    pub fn twitch(id: impl Into<String>) -> Self {
        Self::TwitchEmote { id: id.into() }
    }

    pub fn emoji_from_str(s: &str) -> Self {
        Self::Emoji {
            codepoints: s.chars().map(|c| c as u32).collect(),
        }
    }

    /// Stable string identity: cache filename stem and ranking key.
    pub fn fingerprint(&self) -> String {
        match self {
            Self::TwitchEmote { id } => format!("twitch_{id}"),
            Self::Emoji { codepoints } => format!("emoji_{}", join_codepoints(codepoints)),
        }
    }

    /// The token checked against the forbidden set: the raw Twitch id, or
    /// the dash-joined code point sequence for emojis.
    pub fn ban_token(&self) -> String {
        match self {
            Self::TwitchEmote { id } => id.clone(),
            Self::Emoji { codepoints } => join_codepoints(codepoints),
        }
    }

    /// Deterministic source URL for the image bytes.
    pub fn source_url(&self) -> Url {
        match self {
            Self::TwitchEmote { id } => {
                let base = Url::parse(TWITCH_CDN_BASE).expect("static CDN base URL");
                base.join(&format!("{id}/default/dark/3.0"))
                    .expect("emote id forms a valid URL path")
            }
            Self::Emoji { codepoints } => {
                let base = Url::parse(EMOJI_CDN_BASE).expect("static CDN base URL");
                base.join(&format!("{}.png", join_codepoints(codepoints)))
                    .expect("code points form a valid URL path")
            }
        }
    }
}

fn join_codepoints(codepoints: &[u32]) -> String {
    codepoints
        .iter()
        .map(|cp| format!("{cp:x}"))
        .collect::<Vec<_>>()
        .join("-")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn twitch_fingerprint_is_stable() {
        let key = ImageKey::twitch("25");
        assert_eq!(key.fingerprint(), "twitch_25");
        assert_eq!(key.ban_token(), "25");
    }

    #[test]
    fn emoji_fingerprint_uses_lowercase_hex() {
        let key = ImageKey::emoji_from_str("😀");
        assert_eq!(key.fingerprint(), "emoji_1f600");
        assert_eq!(key.ban_token(), "1f600");
    }

    #[test]
    fn zwj_sequence_joins_all_codepoints() {
        // Family: man, ZWJ, woman, ZWJ, girl, ZWJ, boy.
        let key = ImageKey::emoji_from_str("👨\u{200d}👩\u{200d}👧\u{200d}👦");
        assert_eq!(
            key.ban_token(),
            "1f468-200d-1f469-200d-1f467-200d-1f466"
        );
    }

    #[test]
    fn twitch_url_uses_dark_theme_full_scale() {
        let key = ImageKey::twitch("25");
        assert_eq!(
            key.source_url().as_str(),
            "https://static-cdn.jtvnw.net/emoticons/v2/25/default/dark/3.0"
        );
    }

    #[test]
    fn emoji_url_appends_png_extension() {
        let key = ImageKey::emoji_from_str("😀");
        assert!(key.source_url().as_str().ends_with("/1f600.png"));
    }

    #[test]
    fn structural_equality() {
        assert_eq!(ImageKey::twitch("25"), ImageKey::twitch("25"));
        assert_ne!(ImageKey::twitch("25"), ImageKey::twitch("26"));
        assert_ne!(
            ImageKey::twitch("25"),
            ImageKey::emoji_from_str("😀")
        );
    }
}
