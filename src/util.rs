//! Utility helpers for Storygen.
//!
//! Small pieces shared by the sanitizer, extractor and audit layers:
//! char-boundary-safe truncation, bounded previews for diagnostics, a
//! memoised Aho–Corasick matcher cache and an in-place walker over the
//! string leaves of a JSON value.

use ahash::AHasher;
use aho_corasick::{AhoCorasick, AhoCorasickBuilder, MatchKind};
use dashmap::DashMap;
use once_cell::sync::Lazy;
use serde_json::Value;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

/// Upper bound for text previews written to logs and error messages.
pub const PREVIEW_CHARS: usize = 80;

/// Return the longest prefix of `text` holding at most `max_chars` chars.
/// Never splits a multi-byte character.
pub fn truncate_chars(text: &str, max_chars: usize) -> &str {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

/// Bounded single-line preview of `text` for diagnostics.  Newlines are
/// flattened and an ellipsis marks truncation.
pub fn preview(text: &str, max_chars: usize) -> String {
    let head = truncate_chars(text, max_chars);
    let mut out: String = head
        .chars()
        .map(|c| if c == '\n' || c == '\r' { ' ' } else { c })
        .collect();
    if head.len() < text.len() {
        out.push('…');
    }
    out
}

/// A memoising wrapper around `AhoCorasick` construction to avoid rebuilding
/// automata for the same literal list.  The cache key is a hash of the list.
static AC_CACHE: Lazy<DashMap<u64, Arc<AhoCorasick>>> = Lazy::new(DashMap::new);

/// Given a list of literal patterns, return a shared case-insensitive
/// matcher using leftmost-longest semantics (so `replace_all` prefers the
/// longest overlapping phrase).  Returns `None` for an empty list or when
/// the automaton cannot be built.  Case folding here is ASCII only; use
/// [`replace_all_folded`] to match non-ASCII patterns in any case.
pub fn ac_for(list: &[String]) -> Option<Arc<AhoCorasick>> {
    if list.is_empty() {
        return None;
    }
    let mut hasher = AHasher::default();
    for pat in list {
        pat.hash(&mut hasher);
    }
    let key = hasher.finish();
    if let Some(existing) = AC_CACHE.get(&key) {
        return Some(existing.clone());
    }
    let lower: Vec<String> = list.iter().map(|p| p.to_lowercase()).collect();
    match AhoCorasickBuilder::new()
        .ascii_case_insensitive(true)
        .match_kind(MatchKind::LeftmostLongest)
        .build(lower)
    {
        Ok(ac) => {
            let arc = Arc::new(ac);
            AC_CACHE.insert(key, arc.clone());
            Some(arc)
        }
        Err(err) => {
            tracing::warn!(error = %err, patterns = list.len(), "failed to build signature matcher");
            None
        }
    }
}

/// Replace every match of `ac` in `text` with `replacement`, matching
/// against a lowercased copy so non-ASCII patterns fold case too.  Offsets
/// are mapped back to `text`; unmatched parts are copied verbatim.  Returns
/// the first matched slice and the rewritten text, or `None` when nothing
/// matched.
pub fn replace_all_folded(
    ac: &AhoCorasick,
    text: &str,
    replacement: &str,
) -> Option<(String, String)> {
    let mut folded = String::with_capacity(text.len());
    // Byte offset in `text` for every byte of `folded`, plus the end.
    let mut origin = Vec::with_capacity(text.len() + 1);
    for (idx, c) in text.char_indices() {
        for lc in c.to_lowercase() {
            folded.push(lc);
            origin.extend(std::iter::repeat(idx).take(lc.len_utf8()));
        }
    }
    origin.push(text.len());

    let mut first = None;
    let mut out = String::with_capacity(text.len());
    let mut last = 0;
    for m in ac.find_iter(&folded) {
        let (start, end) = (origin[m.start()], origin[m.end()]);
        if end <= start || start < last {
            continue;
        }
        first.get_or_insert_with(|| text[start..end].to_string());
        out.push_str(&text[last..start]);
        out.push_str(replacement);
        last = end;
    }
    let first = first?;
    out.push_str(&text[last..]);
    Some((first, out))
}

/// Apply `f` to every string leaf of `value`, descending into arrays and
/// objects.  Object keys are left untouched.
pub fn for_each_string_mut<F>(value: &mut Value, f: &mut F)
where
    F: FnMut(&mut String),
{
    match value {
        Value::String(s) => f(s),
        Value::Array(arr) => {
            for v in arr {
                for_each_string_mut(v, f);
            }
        }
        Value::Object(map) => {
            for (_k, v) in map.iter_mut() {
                for_each_string_mut(v, f);
            }
        }
        _ => {}
    }
}
