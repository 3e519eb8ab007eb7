//! Provider selector (C5).
//!
//! Picks the next candidate provider for a group, given a set of already-
//! excluded provider ids from earlier failed attempts in the same request.

use crate::db::{self, Membership, Provider};
use std::collections::HashSet;

#[derive(Debug, Clone, Copy, Default)]
pub struct SelectorOptions {
    /// Gates the health-filter relaxation for the failover threshold
    /// setting. Off by default to stay bug-compatible with operators who
    /// never configured the setting.
    pub health_filter_enabled: bool,
    pub failover_threshold_count: Option<i64>,
    pub failover_threshold_period_minutes: Option<i64>,
}

pub fn select(
    group_name: &str,
    excluded: &HashSet<i64>,
    opts: &SelectorOptions,
) -> rusqlite::Result<Option<(Provider, Membership)>> {
    let Some(group) = db::get_group_by_name(group_name)? else {
        return Ok(None);
    };

    let mut candidates: Vec<(Provider, Membership)> = db::active_memberships_for_group(group.id)?
        .into_iter()
        .filter(|(p, _)| !excluded.contains(&p.id))
        .collect();

    if candidates.is_empty() {
        return Ok(None);
    }

    candidates.sort_by(|(pa, ma), (pb, mb)| {
        ma.priority
            .cmp(&mb.priority)
            .then(ma.active_calls.cmp(&mb.active_calls))
            .then(pa.id.cmp(&pb.id))
    });

    if opts.health_filter_enabled {
        if let (Some(n), Some(t)) = (opts.failover_threshold_count, opts.failover_threshold_period_minutes) {
            let since = chrono::Utc::now().timestamp() - t * 60;
            let healthy: Vec<_> = candidates
                .iter()
                .cloned()
                .filter(|(p, _)| db::failure_count_since(p.id, since).unwrap_or(0) < n)
                .collect();
            if let Some(first) = healthy.into_iter().next() {
                return Ok(Some(first));
            }
            // every candidate skipped: relax the filter, fall through to the
            // original least-loaded candidate so the request is still attempted.
        }
    }

    Ok(candidates.into_iter().next())
}

/// Authorization pre-filter: matches the client's declared model string
/// against the group names an API key is authorized for.
pub fn authorize_model(model: &str, authorized_groups: &[String]) -> Option<String> {
    if let Some(exact) = authorized_groups.iter().find(|g| g.as_str() == model) {
        return Some(exact.clone());
    }

    if let Some(found) = authorized_groups.iter().find(|g| {
        let g = g.as_str();
        g.ends_with(&format!("/{model}")) || model.ends_with(&format!("/{g}"))
    }) {
        return Some(found.clone());
    }

    let rewritten = if model.starts_with("claude-") {
        Some(format!("anthropic/{}", &model["claude-".len()..]))
    } else if model.starts_with("gpt-") {
        Some(format!("openai/{}", &model["gpt-".len()..]))
    } else {
        None
    };
    if let Some(rewritten) = rewritten {
        if let Some(found) = authorized_groups.iter().find(|g| g.as_str() == rewritten) {
            return Some(found.clone());
        }
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exact_match_wins_first() {
        let groups = vec!["gpt-4".to_string(), "anthropic/claude-3".to_string()];
        assert_eq!(authorize_model("gpt-4", &groups), Some("gpt-4".to_string()));
    }

    #[test]
    fn suffix_match_on_slash() {
        let groups = vec!["anthropic/claude-3".to_string()];
        assert_eq!(authorize_model("claude-3", &groups), Some("anthropic/claude-3".to_string()));
    }

    #[test]
    fn claude_prefix_rewrite() {
        let groups = vec!["anthropic/opus".to_string()];
        assert_eq!(authorize_model("claude-opus", &groups), Some("anthropic/opus".to_string()));
    }

    #[test]
    fn gpt_prefix_rewrite() {
        let groups = vec!["openai/4o".to_string()];
        assert_eq!(authorize_model("gpt-4o", &groups), Some("openai/4o".to_string()));
    }

    #[test]
    fn no_match_returns_none() {
        let groups = vec!["other".to_string()];
        assert_eq!(authorize_model("gpt-4", &groups), None);
    }
}
