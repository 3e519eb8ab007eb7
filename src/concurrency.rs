//! Concurrency counter (C6).
//!
//! A `Drop`-based guard around `db::incr_active`/`db::decr_active`, so every
//! exit path from an attempt — success, error, retry, early return, even a
//! panic unwind — still decrements. Mirrors the per-request limit guard
//! already present in the forwarding layer, but backed by the persisted
//! per-membership counter rather than an in-memory map.

use crate::{db, logger};

pub struct ActiveCallGuard {
    provider_id: i64,
    group_id: i64,
    released: bool,
}

impl ActiveCallGuard {
    /// Increments the membership's `active_calls` and returns a guard that
    /// decrements it on drop.
    pub fn acquire(provider_id: i64, group_id: i64) -> rusqlite::Result<Self> {
        db::incr_active(provider_id, group_id)?;
        Ok(Self { provider_id, group_id, released: false })
    }

    /// Releases early; `Drop` becomes a no-op afterward. Not required for
    /// correctness — only to make an explicit release point visible in the
    /// attempt loop when it helps readability.
    pub fn release(mut self) {
        let _ = db::decr_active(self.provider_id, self.group_id);
        self.released = true;
    }
}

impl Drop for ActiveCallGuard {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        if let Err(e) = db::decr_active(self.provider_id, self.group_id) {
            logger::error("concurrency", &format!("failed to decrement active_calls: {e}"));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn guard_decrements_on_drop() {
        let dir = std::env::temp_dir().join(format!("gw-conc-{}.db", std::process::id()));
        std::env::set_var("GATEWAY_DB_PATH", dir.to_str().unwrap());
        db::init();

        let provider = db::create_provider(&db::NewProvider {
            name: "p".into(),
            endpoint: "https://example.com".into(),
            api_key: "k".into(),
            upstream_model: "m".into(),
            unified_price_per_million: None,
            input_price_per_million: None,
            output_price_per_million: None,
            billing_mode: None,
        })
        .unwrap();
        let group = db::create_group("g").unwrap();
        db::upsert_membership(provider.id, group.id, 1).unwrap();

        {
            let _guard = ActiveCallGuard::acquire(provider.id, group.id).unwrap();
            let active = db::active_memberships_for_group(group.id).unwrap();
            assert_eq!(active[0].1.active_calls, 1);
        }

        let active = db::active_memberships_for_group(group.id).unwrap();
        assert_eq!(active[0].1.active_calls, 0);

        std::fs::remove_file(&dir).ok();
    }
}
