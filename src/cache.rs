use anyhow::Result;
use redis::aio::ConnectionManager;

use crate::models::TierBudget;

/// Redis-backed read-through cache in front of the Budget Store.
///
/// The write/tick loop in the connection handler reads the user's budget
/// on every tick (§4.3) to decide whether to emit a low-credit warning;
/// caching that read for a few seconds keeps a busy connection from
/// hammering Postgres. The cache is best-effort: a miss or a Redis error
/// always falls back to the Budget Store, never surfaces to the caller.
pub struct BudgetCache;

const TTL_SECS: usize = 5;

impl BudgetCache {
    fn key(user_id: &str, tier: &str) -> String {
        format!("budget:{user_id}:{tier}")
    }

    pub async fn get(cache: &ConnectionManager, user_id: &str, tier: &str) -> Option<TierBudget> {
        let mut con = cache.clone();
        let raw: Option<String> = redis::cmd("GET")
            .arg(Self::key(user_id, tier))
            .query_async(&mut con)
            .await
            .ok()?;
        raw.and_then(|s| serde_json::from_str(&s).ok())
    }

    pub async fn set(cache: &ConnectionManager, budget: &TierBudget) -> Result<()> {
        let mut con = cache.clone();
        let json = serde_json::to_string(budget)?;
        redis::cmd("SET")
            .arg(Self::key(&budget.user_id, &budget.tier))
            .arg(json)
            .arg("EX")
            .arg(TTL_SECS)
            .query_async::<_, ()>(&mut con)
            .await?;
        Ok(())
    }

    /// Invalidate the cached row after a write (topup or debit), so the
    /// next read observes the authoritative Postgres value rather than a
    /// stale one for up to `TTL_SECS`.
    pub async fn invalidate(cache: &ConnectionManager, user_id: &str, tier: &str) -> Result<()> {
        let mut con = cache.clone();
        redis::cmd("DEL")
            .arg(Self::key(user_id, tier))
            .query_async::<_, ()>(&mut con)
            .await?;
        Ok(())
    }
}
