//! Shared normalization functions for digital/physical track matching.
//! Used by the resolver during runs and by the manual-review commands.
//!
//! CRITICAL: Any change here shifts scores for every stored decision. A rule
//! change makes the next run report those shifts as changed decisions.

use any_ascii::any_ascii;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;
use unicode_normalization::UnicodeNormalization;

// ============================================================================
// REGEX PATTERNS
// ============================================================================

/// Innermost bracketed group: "(Original Mix)", "[Radio Edit]", "{Live}".
/// Applied repeatedly so nested groups peel from the inside out.
pub static BRACKETED: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\s*[\(\[\{][^\(\)\[\]\{\}]*[\)\]\}]").unwrap());

/// Featured artists without brackets: "Song feat. Artist", "Artist ft. Someone"
pub static FEATURING: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\s+(?:feat\.?|ft\.?|featuring)\s+.+$").unwrap());

/// Dash-introduced qualifiers at the end of a title (applied in order).
pub static DASH_QUALIFIERS: Lazy<Vec<Regex>> = Lazy::new(|| {
    vec![
        // Remaster variants: "- Remastered 2021", "- 2001 Digital Remaster", "/ 1997 Remastered"
        Regex::new(r"(?i)\s*[-–—/]\s*(?:remaster(?:ed)?(?:\s+\d{4})?|(?:\d{4}\s+)?(?:digital\s+)?remaster(?:ed)?)\s*$").unwrap(),
        // Live/acoustic: "- Live at Wembley", "- Acoustic Version"
        Regex::new(r"(?i)\s*[-–—]\s*(?:live(?:\s+(?:at|from|in)\s+.+)?|acoustic(?:\s+version)?)\s*$").unwrap(),
        // Release versions: "- Single Version", "- LP Version", "- Radio Edit", "- 12\" Version"
        Regex::new(r#"(?i)\s*[-–—]\s*(?:single|lp|album|radio|7["']?|12["']?)\s+(?:version|edit)\s*$"#).unwrap(),
        // Mono/stereo: "- Mono", "- Stereo"
        Regex::new(r"(?i)\s*[-–—]\s*(?:mono|stereo)\s*$").unwrap(),
        // Mix attribution: "- Extended Mix", "- Tiga Remix", "- Dub Edit"
        Regex::new(r"(?i)\s*[-–—]\s*[a-z0-9'&.\s]+\s+(?:remix|mix|edit|dub)\s*$").unwrap(),
        // Year versions: "- 2021", "- 1997 Version"
        Regex::new(r"(?i)\s*[-–—]\s*\d{4}(?:\s+(?:version|mix|edit))?\s*$").unwrap(),
    ]
});

/// Matches track number prefixes like "03 - ", "Track 5 - ", "01. ", etc.
pub static TRACK_NUMBER_PREFIX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)^(?:track\s*)?\d{1,3}\s*[-–—._]\s+").unwrap());

/// Matches track number in brackets: "[01] Song", "[12] Title"
pub static TRACK_NUMBER_BRACKET: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\[\d{1,2}\]\s*").unwrap());

/// Matches file extensions left in titles by library exports
pub static FILE_EXTENSION: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\.(flac|mp3|wav|aiff?|m4a|ogg|aac)$").unwrap());

/// Trailing article forms: "Beatles, The", "Dandy Warhols (the)"
pub static TRAILING_ARTICLE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)(?:,\s*the|\s+\(the\))\s*$").unwrap());

/// Regex to collapse multiple whitespace into single space
pub static MULTI_SPACE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s{2,}").unwrap());

// ============================================================================
// NORMALIZED KEY
// ============================================================================

/// Comparable form of an (artist, title) pair. Derived per run, never stored.
///
/// A key whose artist and title tokens are both empty is the "empty" marker:
/// the scorer treats it as matching nothing.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct NormalizedKey {
    pub artist_tokens: Vec<String>,
    pub title_tokens: Vec<String>,
    /// Qualifiers stripped during normalization ("Radio Edit", "feat. X").
    /// Kept for display only; never scored.
    pub annotations: Vec<String>,
}

impl NormalizedKey {
    /// The explicit empty marker.
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.artist_tokens.is_empty() && self.title_tokens.is_empty()
    }

    pub fn artist(&self) -> String {
        self.artist_tokens.join(" ")
    }

    pub fn title(&self) -> String {
        self.title_tokens.join(" ")
    }
}

// ============================================================================
// HELPER FUNCTIONS
// ============================================================================

/// Check if a character is a Unicode combining mark (diacritical mark).
/// Used to filter out accents during normalization.
pub fn is_combining_mark(c: char) -> bool {
    matches!(c as u32, 0x0300..=0x036F | 0x1AB0..=0x1AFF | 0x1DC0..=0x1DFF | 0x20D0..=0x20FF | 0xFE20..=0xFE2F)
}

/// Fold Unicode text to lowercase ASCII by applying NFKD decomposition and
/// removing combining marks, then transliterating what is left.
/// e.g., "Beyoncé" → "beyonce", "Motörhead" → "motorhead"
pub fn fold_to_ascii(s: &str) -> String {
    let stripped: String = s.nfkd().filter(|c| !is_combining_mark(*c)).collect();
    // Cyrillic, Greek, CJK and friends
    any_ascii(&stripped).to_lowercase()
}

/// Normalize punctuation: curly quotes to straight quotes, "&" to "and",
/// common "?"-for-apostrophe encoding damage, and whitespace runs.
pub fn normalize_punctuation(s: &str) -> String {
    let result = s
        .replace(['\u{2018}', '\u{2019}', '\u{00B4}', '\u{0060}'], "'")
        .replace(['\u{201C}', '\u{201D}'], "\"")
        .replace(['\u{2010}', '\u{2011}'], "-")
        .replace(" & ", " and ")
        // Can?t → Can't, It?s → It's, I?m → I'm
        .replace("?t ", "'t ")
        .replace("?s ", "'s ")
        .replace("?m ", "'m ")
        .replace("?ve ", "'ve ")
        .replace("?re ", "'re ")
        .replace("?ll ", "'ll ");
    MULTI_SPACE.replace_all(result.trim(), " ").to_string()
}

/// Remove every match of `pattern` from `text`, pushing the matched text
/// (minus brackets, dashes and padding) onto `annotations`.
fn take_qualifiers(pattern: &Regex, text: &str, annotations: &mut Vec<String>) -> String {
    let mut kept = String::with_capacity(text.len());
    let mut last = 0;
    for m in pattern.find_iter(text) {
        kept.push_str(&text[last..m.start()]);
        let note = m
            .as_str()
            .trim_matches(|c: char| c.is_whitespace() || "()[]{}-–—/".contains(c));
        if !note.is_empty() {
            annotations.push(note.to_string());
        }
        last = m.end();
    }
    kept.push_str(&text[last..]);
    kept
}

/// Strip all bracketed groups, innermost first, then trailing "feat." credits.
fn strip_common_qualifiers(text: &str, annotations: &mut Vec<String>) -> String {
    let mut result = text.to_string();
    while BRACKETED.is_match(&result) {
        result = take_qualifiers(&BRACKETED, &result, annotations);
    }
    take_qualifiers(&FEATURING, &result, annotations)
}

/// Split folded text into word tokens. Apostrophes join ("don't" → "dont"),
/// any other non-alphanumeric character separates.
pub fn tokenize(folded: &str) -> Vec<String> {
    folded
        .replace('\'', "")
        .split(|c: char| !c.is_ascii_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(str::to_string)
        .collect()
}

/// Drop a leading "the" unless it is the only token ("The The" keeps one).
fn drop_leading_article(mut tokens: Vec<String>) -> Vec<String> {
    if tokens.len() > 1 && tokens[0] == "the" {
        tokens.remove(0);
    }
    tokens
}

// ============================================================================
// NORMALIZATION FUNCTIONS
// ============================================================================

/// Normalize a title into tokens, collecting stripped qualifiers.
/// Strips file extensions, track numbers, bracketed and dash qualifiers.
pub fn normalize_title_tokens(title: &str, annotations: &mut Vec<String>) -> Vec<String> {
    let mut result = normalize_punctuation(title);

    // Strip file extension first (before other processing)
    result = FILE_EXTENSION.replace(&result, "").to_string();

    // Track numbers: "[01] Song", "03 - Song"
    result = TRACK_NUMBER_BRACKET.replace(&result, "").to_string();
    result = TRACK_NUMBER_PREFIX.replace(&result, "").to_string();

    result = strip_common_qualifiers(&result, annotations);

    for pattern in DASH_QUALIFIERS.iter() {
        result = take_qualifiers(pattern, &result, annotations);
    }

    drop_leading_article(tokenize(&fold_to_ascii(&result)))
}

/// Normalize an artist name into tokens, collecting featured credits.
/// Handles "The" prefix and ", The" / "(the)" suffix forms.
pub fn normalize_artist_tokens(artist: &str, annotations: &mut Vec<String>) -> Vec<String> {
    let mut result = normalize_punctuation(artist);

    // Suffix article before bracket stripping so "(the)" is not kept as a note
    result = TRAILING_ARTICLE.replace(&result, "").to_string();
    result = strip_common_qualifiers(&result, annotations);

    drop_leading_article(tokenize(&fold_to_ascii(&result)))
}

/// Canonicalize a raw (artist, title) pair into a comparable key.
///
/// Never fails. If both fields reduce to nothing the result is the empty
/// marker (annotations are still kept for display).
pub fn normalize(artist: &str, title: &str) -> NormalizedKey {
    let mut annotations = Vec::new();
    let artist_tokens = normalize_artist_tokens(artist, &mut annotations);
    let title_tokens = normalize_title_tokens(title, &mut annotations);

    if artist_tokens.is_empty() && title_tokens.is_empty() {
        return NormalizedKey {
            annotations,
            ..NormalizedKey::empty()
        };
    }

    NormalizedKey {
        artist_tokens,
        title_tokens,
        annotations,
    }
}

// ============================================================================
// TESTS
// ============================================================================
