//! Synthetic tokens that page through already-fetched content.

use uuid::Uuid;

use crate::types::{ContentId, Payload, StructureOp};

pub const SYNTHETIC_TOKEN_PREFIX: &str = "_token:";

pub fn is_synthetic_token_id(content_id: &str) -> bool {
    content_id.starts_with(SYNTHETIC_TOKEN_PREFIX)
}

/// ADD op for a fresh synthetic token under `parent_id`.
pub(crate) fn synthetic_token_op(parent_id: &ContentId) -> StructureOp {
    let content_id = format!("{}{}", SYNTHETIC_TOKEN_PREFIX, Uuid::new_v4());
    let payload = Payload::token(content_id.as_bytes().to_vec());
    StructureOp::add_child(parent_id.clone(), content_id, payload).synthetic()
}

/// Children `start..end` form the exposed page; a token goes at `end`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct PageWindow {
    pub start: usize,
    pub end: usize,
    pub insert_token: bool,
}

/// Splits `child_count` children into the next page starting at `start`.
///
/// A short tail (fewer than `min_page_size` children after the page) is
/// folded into the page instead of getting its own token.
pub(crate) fn page_window(
    child_count: usize,
    start: usize,
    page_size: usize,
    min_page_size: usize,
) -> PageWindow {
    if child_count <= start {
        log::warn!(
            "page starts beyond child count start={} child_count={}",
            start,
            child_count
        );
        return PageWindow {
            start: 0,
            end: child_count,
            insert_token: false,
        };
    }
    let mut end = start + page_size.min(child_count - start);
    if child_count - end < min_page_size {
        end = child_count;
    }
    PageWindow {
        start,
        end,
        insert_token: end < child_count,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_when_enough_children_follow() {
        let window = page_window(25, 0, 10, 5);
        assert_eq!(window.end, 10);
        assert!(window.insert_token);
    }

    #[test]
    fn short_tail_is_folded_into_page() {
        let window = page_window(13, 0, 10, 5);
        assert_eq!(window.end, 13);
        assert!(!window.insert_token);
    }

    #[test]
    fn exact_fit_has_no_token() {
        let window = page_window(10, 0, 10, 0);
        assert_eq!(window.end, 10);
        assert!(!window.insert_token);
    }

    #[test]
    fn huge_sizes_expose_everything() {
        let window = page_window(2, 0, usize::MAX, usize::MAX);
        assert_eq!((window.start, window.end), (0, 2));
        assert!(!window.insert_token);

        let window = page_window(8, 3, usize::MAX, 1);
        assert_eq!(window.end, 8);
    }

    #[test]
    fn start_beyond_children_exposes_everything() {
        let window = page_window(3, 7, 10, 0);
        assert_eq!((window.start, window.end), (0, 3));
        assert!(!window.insert_token);
    }

    #[test]
    fn synthetic_ids_are_prefixed_and_unique() {
        let parent = ContentId::from("root");
        let first = synthetic_token_op(&parent);
        let second = synthetic_token_op(&parent);
        assert!(is_synthetic_token_id(first.content_id.as_str()));
        assert!(first.is_synthetic);
        assert_ne!(first.content_id, second.content_id);
        assert_eq!(first.parent_id.as_ref(), Some(&parent));
    }
}
