//! Post-processing: deterministic cleanup of model replies before they are
//! checked against the extraction schema.
//!
//! Strict structured-output APIs return bare JSON, but providers that only
//! follow the schema through the prompt occasionally wrap the object in
//! ```` ```json ```` fences, prefix a BOM, or sprinkle zero-width characters.
//! None of that is content, so it is removed here rather than prompting
//! harder.
//!
//! ## Rule Order
//!
//! Invisible characters go first so a BOM before the opening fence does not
//! hide the fence from the regex.

use once_cell::sync::Lazy;
use regex::Regex;

/// Apply all cleanup rules to a raw model reply.
///
/// Rules (applied in order):
/// 1. Strip invisible Unicode (BOM, zero-width spaces, soft hyphens)
/// 2. Normalise line endings (CRLF → LF)
/// 3. Strip outer code fences, with or without a `json` tag
/// 4. Trim surrounding whitespace
pub fn clean_json_reply(input: &str) -> String {
    let s = remove_invisible_chars(input);
    let s = normalise_line_endings(&s);
    let s = strip_code_fences(&s);
    s.trim().to_string()
}

// ── Rule 1: Remove invisible Unicode characters ─────────────────────────────

fn remove_invisible_chars(input: &str) -> String {
    input.replace(
        [
            '\u{200B}', '\u{FEFF}', '\u{00AD}', '\u{200C}', '\u{200D}', '\u{2060}',
        ],
        "",
    )
}

// ── Rule 2: Normalise line endings ───────────────────────────────────────────

fn normalise_line_endings(input: &str) -> String {
    input.replace("\r\n", "\n").replace('\r', "\n")
}

// ── Rule 3: Strip outer code fences ──────────────────────────────────────────

static RE_OUTER_FENCES: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?si)^```(?:json)?[ \t]*\n(.*?)\n?```\s*$").unwrap());

fn strip_code_fences(input: &str) -> String {
    match RE_OUTER_FENCES.captures(input.trim()) {
        Some(caps) => caps[1].to_string(),
        None => input.to_string(),
    }
}
