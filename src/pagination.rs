//! Compaction pagination - serve long transcripts a few compactions at a time.
//!
//! A page is a suffix of the (optionally cursor-restricted) sequence that
//! starts at a compaction boundary. Walking backward with the returned cursor
//! yields every message exactly once.
//!
//! Cut rule for `tail_compactions = N` over `k` boundaries in scope:
//! - `N == 0` or `k < N`: the whole scope, nothing older.
//! - `N >= 2`: start at boundary `k - N + 1` (0-based), so the page spans the
//!   live tail plus `N - 1` compacted segments.
//! - `N == 1`: start just after the last boundary, or at the boundary itself
//!   when nothing follows it.

use crate::sessions::NormalizedMessage;
use serde::Serialize;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PageInfo {
    pub has_older_messages: bool,
    pub total_message_count: usize,
    pub returned_message_count: usize,
    /// Id of the first returned message; pass back as `before_message_id`
    pub truncated_before_message_id: Option<String>,
    /// Boundaries inside the searched range
    pub total_compactions: usize,
}

/// Slice `messages` down to the last `tail_compactions` compaction segments.
pub fn slice_at_compactions<'a>(
    messages: &'a [NormalizedMessage],
    tail_compactions: usize,
    before_message_id: Option<&str>,
) -> (&'a [NormalizedMessage], PageInfo) {
    let scope = match before_message_id
        .and_then(|id| messages.iter().position(|m| m.canonical_id() == id || m.uuid == id))
    {
        Some(end) => &messages[..end],
        None => messages,
    };

    let boundaries: Vec<usize> = scope
        .iter()
        .enumerate()
        .filter(|(_, m)| m.is_compact_boundary())
        .map(|(i, _)| i)
        .collect();
    let k = boundaries.len();

    let start = match tail_compactions {
        n if n == 0 || k < n => 0,
        1 => {
            let last = boundaries[k - 1];
            if last + 1 < scope.len() {
                last + 1
            } else {
                last
            }
        }
        n => boundaries[k - n + 1],
    };

    let page = &scope[start..];
    let info = PageInfo {
        has_older_messages: start > 0,
        total_message_count: messages.len(),
        returned_message_count: page.len(),
        truncated_before_message_id: page.first().map(|m| m.canonical_id().to_string()),
        total_compactions: k,
    };
    (page, info)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn transcript(len: usize, boundaries: &[usize]) -> Vec<NormalizedMessage> {
        (0..len)
            .map(|i| {
                let id = format!("m{}", i);
                if boundaries.contains(&i) {
                    NormalizedMessage::compact_boundary(id, "", "compacted")
                } else {
                    NormalizedMessage::new(id, "user", "")
                }
            })
            .collect()
    }

    fn ids(page: &[NormalizedMessage]) -> Vec<&str> {
        page.iter().map(|m| m.uuid.as_str()).collect()
    }

    #[test]
    fn two_compactions_of_thirteen() {
        let messages = transcript(13, &[1, 3, 6, 8]);
        let (page, info) = slice_at_compactions(&messages, 2, None);
        assert_eq!(ids(page), vec!["m8", "m9", "m10", "m11", "m12"]);
        assert!(info.has_older_messages);
        assert_eq!(info.truncated_before_message_id.as_deref(), Some("m8"));
        assert_eq!(info.total_message_count, 13);
        assert_eq!(info.returned_message_count, 5);
        assert_eq!(info.total_compactions, 4);
    }

    #[test]
    fn fewer_boundaries_than_requested_returns_everything() {
        let messages = transcript(6, &[2]);
        let (page, info) = slice_at_compactions(&messages, 3, None);
        assert_eq!(page.len(), 6);
        assert!(!info.has_older_messages);

        let (page, info) = slice_at_compactions(&messages, 0, None);
        assert_eq!(page.len(), 6);
        assert!(!info.has_older_messages);
    }

    #[test]
    fn single_compaction_tail() {
        let messages = transcript(6, &[2]);
        let (page, info) = slice_at_compactions(&messages, 1, None);
        assert_eq!(ids(page), vec!["m3", "m4", "m5"]);
        assert!(info.has_older_messages);

        // Boundary is the last message
        let messages = transcript(3, &[2]);
        let (page, _) = slice_at_compactions(&messages, 1, None);
        assert_eq!(ids(page), vec!["m2"]);
    }

    #[test]
    fn unknown_cursor_uses_whole_sequence() {
        let messages = transcript(13, &[1, 3, 6, 8]);
        let (page, _) = slice_at_compactions(&messages, 2, Some("missing"));
        assert_eq!(page.first().map(|m| m.uuid.as_str()), Some("m8"));
    }

    #[test]
    fn walking_backward_reconstructs_sequence() {
        let messages = transcript(13, &[1, 3, 6, 8]);
        for n in 0..6 {
            let mut pages: Vec<Vec<String>> = Vec::new();
            let mut cursor: Option<String> = None;
            loop {
                let (page, info) = slice_at_compactions(&messages, n, cursor.as_deref());
                pages.push(page.iter().map(|m| m.uuid.clone()).collect());
                if !info.has_older_messages {
                    break;
                }
                cursor = info.truncated_before_message_id;
            }
            let rebuilt: Vec<String> = pages.into_iter().rev().flatten().collect();
            let expected: Vec<String> = messages.iter().map(|m| m.uuid.clone()).collect();
            assert_eq!(rebuilt, expected, "tail_compactions = {}", n);
        }
    }
}
