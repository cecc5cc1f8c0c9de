//! Renders supplied conversation history into the text handed to the engine.

use chrono::{DateTime, Utc};

use super::models::{HistoryEntry, HistoryRole};

const HEADER: &str = "Recent conversation history:";

/// Entries further apart than this get a date separator.
const GAP_SECS: i64 = 7 * 24 * 60 * 60;

/// Format the most recent `limit` entries.
///
/// When `exclude_current` is set and the newest entry is from the user, it is
/// dropped: that entry is the message being processed. System entries and blank
/// content are skipped. Returns an empty string when nothing remains.
pub fn format_history(entries: &[HistoryEntry], limit: usize, exclude_current: bool) -> String {
    let start = entries.len().saturating_sub(limit);
    let mut recent = &entries[start..];
    if exclude_current {
        if let Some((last, rest)) = recent.split_last() {
            if last.role == HistoryRole::User {
                recent = rest;
            }
        }
    }

    let mut lines = Vec::new();
    let mut prev: Option<DateTime<Utc>> = None;
    for entry in recent {
        let content = entry.content.trim();
        if entry.role == HistoryRole::System || content.is_empty() {
            continue;
        }
        let at = entry
            .created_at
            .and_then(|secs| DateTime::<Utc>::from_timestamp(secs, 0));

        if let (Some(at), Some(prev)) = (at, prev) {
            if (at - prev).num_seconds() > GAP_SECS {
                lines.push(format!("\n--- {} ---", at.format("%A, %B %d, %Y")));
            }
        }

        let who = match entry.role {
            HistoryRole::User => "User",
            _ => "Assistant",
        };
        match at {
            Some(at) => {
                lines.push(format!("{who} [{}]: {content}", at.format("%H:%M")));
                prev = Some(at);
            }
            None => lines.push(format!("{who}: {content}")),
        }
    }

    if lines.is_empty() {
        return String::new();
    }
    format!("{HEADER}\n{}", lines.join("\n"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(role: HistoryRole, content: &str, at: Option<i64>) -> HistoryEntry {
        HistoryEntry {
            role,
            content: content.into(),
            created_at: at,
        }
    }

    #[test]
    fn empty_history_formats_to_empty_string() {
        assert_eq!(format_history(&[], 14, true), "");
    }

    #[test]
    fn current_user_message_is_excluded() {
        let entries = vec![
            entry(HistoryRole::User, "hi", None),
            entry(HistoryRole::Assistant, "hello!", None),
            entry(HistoryRole::User, "what are your hours?", None),
        ];
        let out = format_history(&entries, 14, true);
        assert_eq!(out, "Recent conversation history:\nUser: hi\nAssistant: hello!");
    }

    #[test]
    fn limit_keeps_newest_and_skips_system() {
        let entries = vec![
            entry(HistoryRole::User, "old", None),
            entry(HistoryRole::System, "assigned to agent", None),
            entry(HistoryRole::Assistant, "  ", None),
            entry(HistoryRole::Assistant, "new", None),
        ];
        let out = format_history(&entries, 3, false);
        assert_eq!(out, "Recent conversation history:\nAssistant: new");
    }

    #[test]
    fn long_gaps_get_a_date_separator() {
        let t0 = 1_700_000_000;
        let entries = vec![
            entry(HistoryRole::User, "first", Some(t0)),
            entry(HistoryRole::Assistant, "later", Some(t0 + GAP_SECS + 60)),
        ];
        let out = format_history(&entries, 14, false);
        assert!(out.contains("\n--- "));
        assert!(out.contains("User ["));
        assert!(out.ends_with(": later"));
    }
}
