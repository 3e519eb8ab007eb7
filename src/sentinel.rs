//! Keyword sentinel (C4).
//!
//! Scans accumulated upstream response bytes for operator-declared keywords
//! that mark an attempt as a soft failure, independent of HTTP status.

use crate::db::ErrorKeyword;

/// Returns the first active keyword found as a case-insensitive substring of
/// `body_so_far`. Callers feed the full accumulated (and already-lowercased)
/// body on each check in streaming mode.
pub fn find_match<'a>(keywords: &'a [ErrorKeyword], lowercased_body: &str) -> Option<&'a ErrorKeyword> {
    keywords
        .iter()
        .filter(|k| k.is_active)
        .find(|k| lowercased_body.contains(&k.keyword.to_lowercase()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn keyword(id: i64, word: &str, active: bool) -> ErrorKeyword {
        ErrorKeyword { id, keyword: word.to_string(), description: None, is_active: active, last_triggered: None }
    }

    #[test]
    fn matches_case_insensitively() {
        let keywords = vec![keyword(1, "Insufficient Balance", true)];
        let body = "error: insufficient balance on account".to_lowercase();
        assert!(find_match(&keywords, &body).is_some());
    }

    #[test]
    fn ignores_inactive_keywords() {
        let keywords = vec![keyword(1, "quota", false)];
        let body = "quota exceeded".to_lowercase();
        assert!(find_match(&keywords, &body).is_none());
    }

    #[test]
    fn no_match_returns_none() {
        let keywords = vec![keyword(1, "banned", true)];
        let body = "everything is fine".to_lowercase();
        assert!(find_match(&keywords, &body).is_none());
    }
}
