use std::collections::{HashMap, HashSet};

use tracing::warn;
use unicode_segmentation::UnicodeSegmentation;

use crate::keys::ImageKey;

/// Policy knobs applied while extracting tokens from one message.
#[derive(Debug, Clone, Default)]
pub struct AnalyzerConfig {
    /// Deduplicate repeats of the same key within a single message.
    pub no_summation: bool,
}

const ZWJ: char = '\u{200d}';
const VARIATION_SELECTORS: [char; 2] = ['\u{fe0e}', '\u{fe0f}'];

/// One Twitch emote occurrence from the `emotes` IRCv3 tag.
#[derive(Debug, Clone, PartialEq, Eq)]
struct EmoteSpan {
    id: String,
    start: usize,
    end: usize,
}

/// Parse the `emotes` tag into occurrence spans, sorted by start position.
///
/// Tag grammar: `<id>:<start>-<end>{,<start>-<end>}{/<id>:…}`. Positions are
/// UTF-16 code units the way Twitch counts them (surrogate-sensitive, the
/// same convention the rest of the walk uses). Malformed pieces are dropped
/// with a warning; the remainder of the tag still parses.
fn parse_emote_spans(tag: &str) -> Vec<EmoteSpan> {
    let mut spans = Vec::new();
    for specifier in tag.split('/').filter(|s| !s.is_empty()) {
        let Some((id, ranges)) = specifier.split_once(':') else {
            warn!(specifier, "malformed emote specifier, dropping");
            continue;
        };
        if id.is_empty() || ranges.is_empty() {
            warn!(specifier, "empty emote id or range list, dropping");
            continue;
        }
        for range in ranges.split(',').filter(|r| !r.is_empty()) {
            let parsed = range
                .split_once('-')
                .and_then(|(a, b)| Some((a.parse::<usize>().ok()?, b.parse::<usize>().ok()?)));
            match parsed {
                Some((start, end)) if start <= end => spans.push(EmoteSpan {
                    id: id.to_string(),
                    start,
                    end,
                }),
                _ => warn!(range, emote = id, "malformed emote range, dropping"),
            }
        }
    }
    spans.sort_by_key(|s| s.start);
    spans
}

/// Strip emoji presentation selectors. Clusters containing a zero-width
/// joiner keep them, since the selector is part of the sequence's identity.
fn normalize_cluster(cluster: &str) -> String {
    if cluster.contains(ZWJ) {
        cluster.to_string()
    } else {
        cluster
            .chars()
            .filter(|c| !VARIATION_SELECTORS.contains(c))
            .collect()
    }
}

/// Match one grapheme cluster against the emoji registry, returning the
/// normalized form to emit. Lookups try the literal cluster first, then the
/// selector-stripped form, then the stripped form with an explicit
/// presentation selector (text written without `FE0F` still counts).
fn match_emoji(cluster: &str) -> Option<String> {
    let normalized = normalize_cluster(cluster);
    if emojis::get(cluster).is_some() || emojis::get(&normalized).is_some() {
        return Some(normalized);
    }
    if !cluster.contains(ZWJ) {
        let presented = format!("{normalized}\u{fe0f}");
        if emojis::get(&presented).is_some() {
            return Some(normalized);
        }
    }
    None
}

/// Extract the ordered sequence of image keys from one chat message.
///
/// `tags` is the parsed IRCv3 tag map of the PRIVMSG; `text` its trailing
/// parameter. `forbidden` holds ban tokens (Twitch ids and emoji code point
/// strings) that are silently skipped. Sender filtering happens upstream.
pub fn extract_tokens(
    tags: &HashMap<String, String>,
    text: &str,
    forbidden: &HashSet<String>,
    config: &AnalyzerConfig,
) -> Vec<ImageKey> {
    let spans = tags
        .get("emotes")
        .map(|tag| parse_emote_spans(tag))
        .unwrap_or_default();
    // An emote-only message has no content besides the spans, so the emoji
    // walk can be skipped.
    let emote_only = tags.get("emote-only").map(String::as_str) == Some("1");

    let clusters: Vec<(usize, &str)> = {
        let mut position = 0usize;
        text.graphemes(true)
            .map(|cluster| {
                let start = position;
                position += cluster.chars().map(char::len_utf16).sum::<usize>();
                (start, cluster)
            })
            .collect()
    };

    let mut tokens = Vec::new();
    let mut seen = HashSet::new();
    let mut emit = |key: ImageKey, tokens: &mut Vec<ImageKey>| {
        if forbidden.contains(&key.ban_token()) {
            return;
        }
        if config.no_summation && !seen.insert(key.fingerprint()) {
            return;
        }
        tokens.push(key);
    };

    let mut span_iter = spans.into_iter().peekable();
    let mut i = 0;
    while i < clusters.len() {
        let (position, cluster) = clusters[i];

        // Skip spans the walk has already passed (overlapping or duplicate
        // ranges in a hostile tag).
        while span_iter
            .peek()
            .is_some_and(|span| span.end < position)
        {
            span_iter.next();
        }

        if let Some(span) = span_iter.peek() {
            if span.start <= position && position <= span.end {
                let span = span_iter.next().expect("peeked span");
                emit(ImageKey::twitch(span.id), &mut tokens);
                while i < clusters.len() && clusters[i].0 <= span.end {
                    i += 1;
                }
                continue;
            }
        }

        if !emote_only {
            if let Some(normalized) = match_emoji(cluster) {
                emit(ImageKey::emoji_from_str(&normalized), &mut tokens);
            }
        }
        i += 1;
    }

    tokens
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tags_with_emotes(emotes: &str) -> HashMap<String, String> {
        let mut tags = HashMap::new();
        tags.insert("emotes".to_string(), emotes.to_string());
        tags
    }

    fn extract(
        tags: &HashMap<String, String>,
        text: &str,
    ) -> Vec<ImageKey> {
        extract_tokens(tags, text, &HashSet::new(), &AnalyzerConfig::default())
    }

    #[test]
    fn double_kappa_in_message_order() {
        let tags = tags_with_emotes("25:0-4,6-10");
        let tokens = extract(&tags, "Kappa Kappa");
        assert_eq!(
            tokens,
            vec![ImageKey::twitch("25"), ImageKey::twitch("25")]
        );
    }

    #[test]
    fn emote_span_at_end_of_message() {
        let tags = tags_with_emotes("25:6-10");
        let tokens = extract(&tags, "hello Kappa");
        assert_eq!(tokens, vec![ImageKey::twitch("25")]);
    }

    #[test]
    fn interleaves_emotes_and_emojis_in_reading_order() {
        let tags = tags_with_emotes("25:3-7");
        let tokens = extract(&tags, "😀 Kappa 😀");
        assert_eq!(
            tokens,
            vec![
                ImageKey::emoji_from_str("😀"),
                ImageKey::twitch("25"),
                ImageKey::emoji_from_str("😀"),
            ]
        );
    }

    #[test]
    fn astral_emoji_before_span_keeps_indices_aligned() {
        // 😀 is a surrogate pair, two UTF-16 units, so Kappa sits at 3-7.
        let tags = tags_with_emotes("25:3-7");
        let tokens = extract(&tags, "😀 Kappa");
        assert_eq!(
            tokens,
            vec![ImageKey::emoji_from_str("😀"), ImageKey::twitch("25")]
        );
    }

    #[test]
    fn zwj_sequence_is_one_token() {
        let family = "👨\u{200d}👩\u{200d}👧\u{200d}👦";
        let tokens = extract(&HashMap::new(), family);
        assert_eq!(tokens, vec![ImageKey::emoji_from_str(family)]);
    }

    #[test]
    fn variation_selector_is_stripped_outside_zwj() {
        let tokens = extract(&HashMap::new(), "❤\u{fe0f}");
        assert_eq!(tokens, vec![ImageKey::emoji_from_str("❤")]);
    }

    #[test]
    fn bare_text_presentation_still_matches() {
        let tokens = extract(&HashMap::new(), "❤");
        assert_eq!(tokens, vec![ImageKey::emoji_from_str("❤")]);
    }

    #[test]
    fn keycap_sequence_is_one_token() {
        let tokens = extract(&HashMap::new(), "1\u{fe0f}\u{20e3}");
        assert_eq!(tokens, vec![ImageKey::emoji_from_str("1\u{20e3}")]);
    }

    #[test]
    fn plain_text_yields_nothing() {
        assert!(extract(&HashMap::new(), "just words here").is_empty());
    }

    #[test]
    fn no_summation_collapses_repeats() {
        let mut tags = tags_with_emotes("25:0-4,6-10,12-16,18-22,24-28,30-34,36-40,42-46,48-52,54-58");
        let text = ["Kappa"; 10].join(" ");
        let config = AnalyzerConfig { no_summation: true };
        let tokens = extract_tokens(&tags, &text, &HashSet::new(), &config);
        assert_eq!(tokens, vec![ImageKey::twitch("25")]);

        tags.clear();
        let tokens = extract_tokens(
            &tags,
            "😀 😀 😀",
            &HashSet::new(),
            &config,
        );
        assert_eq!(tokens, vec![ImageKey::emoji_from_str("😀")]);
    }

    #[test]
    fn forbidden_emote_id_is_skipped() {
        let tags = tags_with_emotes("25:0-4");
        let forbidden: HashSet<String> = ["25".to_string()].into();
        let tokens =
            extract_tokens(&tags, "Kappa", &forbidden, &AnalyzerConfig::default());
        assert!(tokens.is_empty());
    }

    #[test]
    fn forbidden_emoji_codepoints_are_skipped() {
        let forbidden: HashSet<String> = ["1f600".to_string()].into();
        let tokens =
            extract_tokens(&HashMap::new(), "😀", &forbidden, &AnalyzerConfig::default());
        assert!(tokens.is_empty());
    }

    #[test]
    fn emote_only_skips_emoji_walk() {
        let mut tags = tags_with_emotes("25:0-4");
        tags.insert("emote-only".to_string(), "1".to_string());
        let tokens = extract(&tags, "Kappa");
        assert_eq!(tokens, vec![ImageKey::twitch("25")]);
    }

    #[test]
    fn malformed_ranges_do_not_poison_the_rest() {
        let tags = tags_with_emotes("25:bogus,0-4/:-/99:");
        let tokens = extract(&tags, "Kappa");
        assert_eq!(tokens, vec![ImageKey::twitch("25")]);
    }

    #[test]
    fn spans_parse_sorted_by_start() {
        let spans = parse_emote_spans("1:6-10/2:0-4");
        assert_eq!(spans[0].id, "2");
        assert_eq!(spans[1].id, "1");
    }
}
