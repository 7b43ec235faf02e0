use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::aio::ConnectionManager;
use sqlx::{Pool, Postgres};

use crate::cache::BudgetCache;
use crate::config::Config;
use crate::db;
use crate::error::AppError;
use crate::llm::{model_for_tier, CacheDescriptor, ChatBinding, LlmCacheClient};
use crate::models::{CacheRecord, Tier, TerminationReason, TierBudget};

/// Everything the Session Manager and the Research Orchestrator need from
/// the Cache Manager, behind a trait so both can be exercised against a
/// fake in tests without Postgres, Redis, or a live provider.
#[async_trait]
pub trait CacheLifecycle: Send + Sync {
    async fn check_budget(&self, user_id: &str, tier: Tier) -> Result<TierBudget, AppError>;
    /// Unlike `check_budget`, never fails on exhaustion — used by the
    /// write/tick loop to report remaining credit without blocking on it.
    async fn read_budget(&self, user_id: &str, tier: Tier) -> Result<TierBudget, AppError>;
    async fn create_remote_cache(&self, tier: Tier, content: &str) -> Result<CacheDescriptor, AppError>;
    async fn persist_cache_record(
        &self,
        session_id: &str,
        user_id: &str,
        tier: Tier,
        descriptor: &CacheDescriptor,
    ) -> Result<(), AppError>;
    async fn get_generative_handle(&self, cache_name: &str, model: &str) -> Result<ChatBinding, AppError>;
    async fn extend(&self, cache_name: &str, new_expires_at: DateTime<Utc>) -> Result<(), AppError>;
    /// Compensation-only: deletes a just-created remote cache that never
    /// made it into a registered session. Unlike `release`, this never
    /// touches billing — nothing was ever debited against it.
    async fn rollback_remote_cache(&self, cache_name: &str) -> Result<(), AppError>;
    async fn release(
        &self,
        user_id: &str,
        session_id: &str,
        cache_name: &str,
        reason: TerminationReason,
    ) -> Result<(), AppError>;
    async fn topup(&self, user_id: &str, tier: Tier, delta_hours: f64) -> Result<TierBudget, AppError>;
}

/// Concrete Cache Manager: Postgres-backed cache/budget records, a Redis
/// read-through in front of the budget row, and the external LLM provider.
pub struct CacheManager {
    pool: Pool<Postgres>,
    redis: ConnectionManager,
    llm: Arc<dyn LlmCacheClient>,
    config: Arc<Config>,
}

impl CacheManager {
    pub fn new(pool: Pool<Postgres>, redis: ConnectionManager, llm: Arc<dyn LlmCacheClient>, config: Arc<Config>) -> Self {
        Self { pool, redis, llm, config }
    }

    async fn load_budget(&self, user_id: &str, tier: Tier) -> Result<TierBudget, AppError> {
        let tier_str = tier.as_str();
        if let Some(cached) = BudgetCache::get(&self.redis, user_id, tier_str).await {
            return Ok(cached);
        }

        let default_hours = match tier {
            Tier::Base => self.config.initial_budget_base,
            Tier::Pro => self.config.initial_budget_pro,
        };

        let budget = db::ensure_default_budget(&self.pool, user_id, tier_str, default_hours)
            .await
            .map_err(|e| AppError::InternalInvariantViolation(e.to_string()))?;

        let _ = BudgetCache::set(&self.redis, &budget).await;
        Ok(budget)
    }
}

#[async_trait]
impl CacheLifecycle for CacheManager {
    /// Fails with InsufficientCredit if the tier's remaining token-hours
    /// are exhausted. Called before any remote cache is created so a user
    /// out of budget never pays for one.
    async fn check_budget(&self, user_id: &str, tier: Tier) -> Result<TierBudget, AppError> {
        let budget = self.load_budget(user_id, tier).await?;
        if budget.is_exhausted() {
            return Err(AppError::InsufficientCredit { tier: tier.to_string() });
        }
        Ok(budget)
    }

    async fn read_budget(&self, user_id: &str, tier: Tier) -> Result<TierBudget, AppError> {
        self.load_budget(user_id, tier).await
    }

    async fn create_remote_cache(&self, tier: Tier, content: &str) -> Result<CacheDescriptor, AppError> {
        self.llm
            .create_cache(model_for_tier(tier), content, self.config.cache_ttl)
            .await
            .map_err(|e| AppError::CacheCreateFailed(e.to_string()))
    }

    async fn persist_cache_record(
        &self,
        session_id: &str,
        user_id: &str,
        tier: Tier,
        descriptor: &CacheDescriptor,
    ) -> Result<(), AppError> {
        let record = CacheRecord {
            session_id: session_id.to_string(),
            user_id: user_id.to_string(),
            cache_name: descriptor.name.clone(),
            tier: tier.to_string(),
            token_count: descriptor.token_count,
            created_at: descriptor.created_at,
            terminated_at: None,
        };
        db::create_cache_record(&self.pool, &record)
            .await
            .map_err(|e| AppError::CacheCreateFailed(e.to_string()))
    }

    /// Fetches the cache's current descriptor from the provider — confirming
    /// it hasn't expired or been evicted since creation — before deriving a
    /// chat binding from it, per §4.2.
    async fn get_generative_handle(&self, cache_name: &str, model: &str) -> Result<ChatBinding, AppError> {
        self.llm
            .get_cache(cache_name)
            .await
            .map_err(|e| AppError::CacheCreateFailed(format!("cache descriptor lookup failed: {e}")))?;

        self.llm
            .derive_chat(cache_name, model)
            .await
            .map_err(|e| AppError::CacheCreateFailed(format!("chat handle derivation failed: {e}")))
    }

    async fn extend(&self, cache_name: &str, new_expires_at: DateTime<Utc>) -> Result<(), AppError> {
        let remaining = new_expires_at - Utc::now();
        let ttl = remaining.to_std().unwrap_or(std::time::Duration::ZERO);
        self.llm
            .update_ttl(cache_name, ttl)
            .await
            .map_err(|e| AppError::CacheExtendFailed(e.to_string()))
    }

    async fn rollback_remote_cache(&self, cache_name: &str) -> Result<(), AppError> {
        self.llm
            .delete_cache(cache_name)
            .await
            .map_err(|e| AppError::CacheDeleteFailed(e.to_string()))
    }

    /// Four sub-steps that must all be attempted regardless of whether an
    /// earlier one failed: delete the remote cache, mark the record
    /// terminated, update the chat's final metrics, and debit the tier
    /// budget for the elapsed session (plus invalidate the cached budget
    /// row). Errors are collected and surfaced together rather than
    /// short-circuiting the remaining steps.
    async fn release(
        &self,
        user_id: &str,
        session_id: &str,
        cache_name: &str,
        reason: TerminationReason,
    ) -> Result<(), AppError> {
        let mut errors = Vec::new();
        let now = Utc::now();

        if let Err(e) = self.llm.delete_cache(cache_name).await {
            errors.push(format!("remote cache delete: {e}"));
        }

        if let Err(e) = db::mark_cache_terminated(&self.pool, session_id, now, reason).await {
            errors.push(format!("mark terminated: {e}"));
        }

        match db::get_cache_record(&self.pool, session_id).await {
            Ok(Some(record)) => {
                // `created_at` is the provider's own cache-creation timestamp
                // (persisted in step (2) of `Acquire`), not the session's
                // `started_at` — the two can diverge by the latency of the
                // `get_generative_handle` call in `StartSession`, and §4.2's
                // formula is defined in terms of the cache record's lifetime.
                let elapsed_secs = (now - record.created_at).num_seconds().max(0);
                let token_hours = (record.token_count as f64 * elapsed_secs as f64) / (3600.0 * 1_000_000.0);

                let metrics = crate::models::ChatFinalMetrics {
                    duration_secs: elapsed_secs,
                    tokens: record.token_count,
                    tier: record.tier.clone(),
                    token_hours,
                    terminated_at: now,
                };
                if let Err(e) = db::record_final_metrics(&self.pool, session_id, &metrics).await {
                    errors.push(format!("update chat metrics: {e}"));
                }

                if let Err(e) = db::debit_budget(&self.pool, user_id, &record.tier, token_hours).await {
                    errors.push(format!("debit budget: {e}"));
                }
                if let Err(e) = BudgetCache::invalidate(&self.redis, user_id, &record.tier).await {
                    errors.push(format!("invalidate budget cache: {e}"));
                }
            }
            Ok(None) => errors.push("no cache record found to bill against".to_string()),
            Err(e) => errors.push(format!("load cache record: {e}")),
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(AppError::CacheDeleteFailed(errors.join("; ")))
        }
    }

    async fn topup(&self, user_id: &str, tier: Tier, delta_hours: f64) -> Result<TierBudget, AppError> {
        let budget = db::topup_budget(&self.pool, user_id, tier.as_str(), delta_hours)
            .await
            .map_err(|e| AppError::InternalInvariantViolation(e.to_string()))?;
        let _ = BudgetCache::invalidate(&self.redis, user_id, tier.as_str()).await;
        Ok(budget)
    }
}
