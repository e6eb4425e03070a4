//! Signal message parsing and symbol normalization
//!
//! Channel messages look like:
//! ```text
//! 💷 EURUSD-OTC
//! 💎 M5
//! ⌚️ 14:35:00
//! 🔼 call
//! ```
//! Relay messages may instead carry the same fields as JSON.

use once_cell::sync::Lazy;
use regex::Regex;

use crate::models::RawSignal;

/// Symbol, coded duration, HH:MM:SS and direction, each after its marker.
/// The watch emoji may arrive with or without its variation selector.
static CHANNEL_SIGNAL: Lazy<Option<Regex>> = Lazy::new(|| {
    Regex::new(r"💷 (\S+)\s+💎 (M\d+)\s+⌚\x{FE0F}? (\d{2}:\d{2}:\d{2})\s+(🔼 call|🔽 put)").ok()
});

/// Parse a message in either format. Returns None for chatter that is not a signal.
pub fn parse_signal(text: &str) -> Option<RawSignal> {
    let trimmed = text.trim();
    if trimmed.starts_with('{') {
        parse_signal_json(trimmed)
    } else {
        parse_signal_text(trimmed)
    }
}

/// JSON form; every field optional so incomplete signals reach validation
pub fn parse_signal_json(text: &str) -> Option<RawSignal> {
    serde_json::from_str(text).ok()
}

/// Emoji-marked channel text
pub fn parse_signal_text(text: &str) -> Option<RawSignal> {
    let caps = CHANNEL_SIGNAL.as_ref()?.captures(text)?;
    let direction = if caps[4].contains("call") { "call" } else { "put" };
    Some(RawSignal::new(&caps[1], &caps[2], &caps[3], direction))
}

/// Canonical endpoint spelling: lowercase, no separators, `_otc` suffix
pub fn normalize_symbol(symbol: &str) -> String {
    let mut s: String = symbol
        .chars()
        .filter(|c| *c != ' ' && *c != '/')
        .collect::<String>()
        .to_lowercase();

    s = match s.as_str() {
        "eurusdotc" => "eurusd_otc".to_string(),
        "usdphpotc" => "usdphp_otc".to_string(),
        _ => s,
    };

    s = s.replace("-otc", "_otc").replace("otc", "_otc");
    while s.contains("__otc") {
        s = s.replace("__otc", "_otc");
    }
    s
}

/// Spellings to try against the payout map, most specific first
pub fn symbol_variants(symbol: &str) -> Vec<String> {
    let normalized = normalize_symbol(symbol);
    let candidates = [
        normalized.clone(),
        normalized.replace("_otc", ""),
        normalized.replace("_otc", "-otc"),
    ];

    let mut variants: Vec<String> = Vec::with_capacity(candidates.len());
    for c in candidates {
        if !variants.contains(&c) {
            variants.push(c);
        }
    }
    variants
}
