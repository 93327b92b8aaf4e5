//! Follow-up question cleanup.

use std::collections::HashSet;

/// Maximum number of suggestions kept.
pub const MAX_SUGGESTIONS: usize = 5;

/// Maximum length of one suggestion, in characters.
pub const MAX_SUGGESTION_CHARS: usize = 140;

/// Clean, deduplicate and cap raw follow-up questions.
///
/// Entries are trimmed, blank ones dropped, cut to [`MAX_SUGGESTION_CHARS`],
/// given a trailing `?` unless they already end in `?` or `.`, deduplicated
/// case-insensitively keeping the first occurrence, and capped at
/// [`MAX_SUGGESTIONS`]. Re-applying it to its own output is a no-op.
pub fn normalize<I, S>(raw: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut seen = HashSet::new();
    let mut normalized = Vec::new();

    for entry in raw {
        let Some(suggestion) = clean(entry.as_ref()) else {
            continue;
        };
        if seen.insert(suggestion.to_lowercase()) {
            normalized.push(suggestion);
            if normalized.len() >= MAX_SUGGESTIONS {
                break;
            }
        }
    }

    normalized
}

/// Keep only the string entries of a decoded JSON array.
pub fn string_entries(values: &[serde_json::Value]) -> Vec<String> {
    values
        .iter()
        .filter_map(|v| v.as_str().map(str::to_string))
        .collect()
}

fn clean(entry: &str) -> Option<String> {
    let trimmed = entry.trim();
    if trimmed.is_empty() {
        return None;
    }

    let mut suggestion: String = trimmed.chars().take(MAX_SUGGESTION_CHARS).collect();
    // Cutting can expose trailing whitespace.
    suggestion.truncate(suggestion.trim_end().len());

    if !suggestion.ends_with('?') && !suggestion.ends_with('.') {
        if suggestion.chars().count() >= MAX_SUGGESTION_CHARS {
            suggestion.pop();
            suggestion.truncate(suggestion.trim_end().len());
        }
        suggestion.push('?');
    }

    Some(suggestion)
}
