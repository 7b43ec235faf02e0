use std::sync::Arc;

use chrono::{DateTime, Utc};
use sqlx::{Pool, Postgres};
use uuid::Uuid;

use crate::aggregator::ContentAggregator;
use crate::cache_manager::CacheLifecycle;
use crate::db;
use crate::error::AppError;
use crate::llm::model_for_tier;
use crate::models::Tier;
use crate::session::{SessionId, SessionManager};
use crate::storage::ObjectStorage;

/// A new session request: the user, the tier they're paying on, and the
/// sources to aggregate into the cache's content.
pub struct StartSessionRequest {
    pub user_id: String,
    pub tier: Tier,
    pub arxiv_ids: Vec<String>,
    pub uploads: Vec<(String, Vec<u8>)>,
}

pub struct StartSessionResult {
    pub session_id: SessionId,
    pub cache_name: String,
    pub cache_expires_at: DateTime<Utc>,
}

/// Fan-in entry point for starting a research session, implementing the
/// compensation chain: aggregate -> upload raw text -> create cache ->
/// register session -> persist chat header. Each step's rollback
/// obligation on failure is the one named in §4.5.
pub struct Orchestrator {
    pool: Pool<Postgres>,
    aggregator: Arc<ContentAggregator>,
    storage: Arc<dyn ObjectStorage>,
    cache_manager: Arc<dyn CacheLifecycle>,
    session_manager: Arc<SessionManager>,
    cache_ttl_secs: u64,
}

impl Orchestrator {
    pub fn new(
        pool: Pool<Postgres>,
        aggregator: Arc<ContentAggregator>,
        storage: Arc<dyn ObjectStorage>,
        cache_manager: Arc<dyn CacheLifecycle>,
        session_manager: Arc<SessionManager>,
        cache_ttl_secs: u64,
    ) -> Self {
        Self {
            pool,
            aggregator,
            storage,
            cache_manager,
            session_manager,
            cache_ttl_secs,
        }
    }

    pub async fn start_session(&self, req: StartSessionRequest) -> Result<StartSessionResult, AppError> {
        // Pre-check: refused before any external side effect occurs.
        self.cache_manager.check_budget(&req.user_id, req.tier).await?;

        let (content, papers) = self
            .aggregator
            .aggregate(&req.arxiv_ids, &req.uploads)
            .await
            .map_err(|e| AppError::BadInput(format!("content aggregation failed: {e}")))?;

        let blob_key = format!("{}/{}.txt", req.user_id, Uuid::new_v4());
        self.storage
            .put(&blob_key, content.as_bytes())
            .await
            .map_err(|e| AppError::InternalInvariantViolation(format!("raw content upload failed: {e}")))?;

        let descriptor = match self.cache_manager.create_remote_cache(req.tier, &content).await {
            Ok(d) => d,
            Err(e) => {
                self.rollback_upload(&blob_key).await;
                return Err(e);
            }
        };

        let model = model_for_tier(req.tier);
        let session_id = match self
            .session_manager
            .start_session(&req.user_id, req.tier, &descriptor.name, descriptor.created_at, model)
            .await
        {
            Ok(id) => id,
            Err(e) => {
                self.rollback_cache(&descriptor.name).await;
                self.rollback_upload(&blob_key).await;
                return Err(e);
            }
        };

        if let Err(e) = self
            .cache_manager
            .persist_cache_record(&session_id.to_string(), &req.user_id, req.tier, &descriptor)
            .await
        {
            self.session_manager.abort(session_id).await;
            self.rollback_cache(&descriptor.name).await;
            self.rollback_upload(&blob_key).await;
            return Err(e);
        }

        // Provenance rows are best-effort audit trail, not part of the
        // compensation chain proper; a failure here doesn't unwind the
        // session.
        for paper in &papers {
            if let Err(e) = db::save_paper(&self.pool, &paper.paper_id, None, Some(&blob_key), paper.title.as_deref()).await {
                tracing::warn!(paper_id = %paper.paper_id, error = %e, "failed to persist paper provenance row");
            }
            if let Err(e) = db::link_paper_reference(&self.pool, &session_id.to_string(), &paper.paper_id).await {
                tracing::warn!(paper_id = %paper.paper_id, error = %e, "failed to link paper reference");
            }
        }

        let cache_expires_at = descriptor.created_at + chrono::Duration::seconds(self.cache_ttl_secs as i64);

        // Persist chat header: on failure, surface the error but the
        // session and cache registered above remain live, per §4.5.
        db::create_chat_header(&self.pool, &session_id.to_string(), &req.user_id, req.tier.as_str())
            .await
            .map_err(|e| AppError::InternalInvariantViolation(format!("chat header persistence failed: {e}")))?;

        Ok(StartSessionResult {
            session_id,
            cache_name: descriptor.name,
            cache_expires_at,
        })
    }

    async fn rollback_cache(&self, cache_name: &str) {
        if let Err(e) = self.cache_manager.rollback_remote_cache(cache_name).await {
            tracing::warn!(cache_name, error = %e, "rollback: failed to delete remote cache");
        }
    }

    async fn rollback_upload(&self, blob_key: &str) {
        if let Err(e) = self.storage.delete(blob_key).await {
            tracing::warn!(blob_key, error = %e, "rollback: failed to delete uploaded blob");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregator::{StubArxivResolver, StubPdfExtractor};
    use crate::config::Config;
    use crate::llm::{CacheDescriptor, ChatBinding, FakeLlmCacheClient};
    use crate::models::TierBudget;
    use crate::storage::FilesystemObjectStorage;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration as StdDuration;

    struct FakeCacheLifecycle {
        exhausted: bool,
        fail_create: bool,
        created: AtomicBool,
        rolled_back: AtomicBool,
    }

    impl FakeCacheLifecycle {
        fn new() -> Self {
            Self {
                exhausted: false,
                fail_create: false,
                created: AtomicBool::new(false),
                rolled_back: AtomicBool::new(false),
            }
        }
    }

    #[async_trait]
    impl CacheLifecycle for FakeCacheLifecycle {
        async fn check_budget(&self, user_id: &str, tier: Tier) -> Result<TierBudget, AppError> {
            if self.exhausted {
                return Err(AppError::InsufficientCredit { tier: tier.to_string() });
            }
            Ok(TierBudget {
                user_id: user_id.to_string(),
                tier: tier.to_string(),
                token_hours_bought: 5.0,
                token_hours_used: 0.0,
            })
        }

        async fn read_budget(&self, user_id: &str, tier: Tier) -> Result<TierBudget, AppError> {
            self.check_budget(user_id, tier).await
        }

        async fn create_remote_cache(&self, _tier: Tier, _content: &str) -> Result<CacheDescriptor, AppError> {
            if self.fail_create {
                return Err(AppError::CacheCreateFailed("boom".into()));
            }
            self.created.store(true, Ordering::SeqCst);
            Ok(CacheDescriptor {
                name: "cache-xyz".into(),
                token_count: 500,
                created_at: Utc::now(),
            })
        }

        async fn persist_cache_record(
            &self,
            _session_id: &str,
            _user_id: &str,
            _tier: Tier,
            _descriptor: &CacheDescriptor,
        ) -> Result<(), AppError> {
            Ok(())
        }

        async fn get_generative_handle(&self, cache_name: &str, model: &str) -> Result<ChatBinding, AppError> {
            Ok(ChatBinding {
                cache_name: cache_name.to_string(),
                model: model.to_string(),
            })
        }

        async fn extend(&self, _cache_name: &str, _new_expires_at: DateTime<Utc>) -> Result<(), AppError> {
            Ok(())
        }

        async fn rollback_remote_cache(&self, _cache_name: &str) -> Result<(), AppError> {
            self.rolled_back.store(true, Ordering::SeqCst);
            Ok(())
        }

        async fn release(
            &self,
            _user_id: &str,
            _session_id: &str,
            _cache_name: &str,
            _reason: crate::models::TerminationReason,
        ) -> Result<(), AppError> {
            Ok(())
        }

        async fn topup(&self, user_id: &str, tier: Tier, delta_hours: f64) -> Result<TierBudget, AppError> {
            Ok(TierBudget {
                user_id: user_id.to_string(),
                tier: tier.to_string(),
                token_hours_bought: delta_hours,
                token_hours_used: 0.0,
            })
        }
    }

    fn test_config() -> Arc<Config> {
        Arc::new(Config {
            database_url: String::new(),
            redis_url: String::new(),
            llm_provider_host: String::new(),
            cache_ttl: StdDuration::from_secs(900),
            session_timeout: StdDuration::from_secs(600),
            grace_period: StdDuration::from_secs(300),
            session_check_interval: StdDuration::from_secs(30),
            cache_extend: StdDuration::from_secs(300),
            guard_band: StdDuration::from_secs(30),
            reaper_interval: StdDuration::from_secs(60),
            initial_budget_base: 5.0,
            initial_budget_pro: 2.0,
            low_credit_threshold: 0.1,
        })
    }

    fn test_aggregator() -> Arc<ContentAggregator> {
        Arc::new(ContentAggregator::new(Arc::new(StubArxivResolver), Arc::new(StubPdfExtractor)))
    }

    #[tokio::test]
    async fn insufficient_credit_short_circuits_before_any_upload() {
        let dir = tempfile::tempdir().unwrap();
        let storage: Arc<dyn ObjectStorage> = Arc::new(FilesystemObjectStorage::new(dir.path()));
        let config = test_config();
        let llm = Arc::new(FakeLlmCacheClient::new());
        let cache_lifecycle = Arc::new(FakeCacheLifecycle {
            exhausted: true,
            ..FakeCacheLifecycle::new()
        });
        let cache_lifecycle: Arc<dyn CacheLifecycle> = cache_lifecycle;
        let session_manager = Arc::new(SessionManager::new(cache_lifecycle.clone(), llm, config));

        // No pool is touched on this path (the budget check short-circuits
        // before any DB write), so a disconnected pool handle is fine here.
        let pool = sqlx::Pool::<Postgres>::connect_lazy("postgres://unused/unused").unwrap();
        let orchestrator = Orchestrator::new(pool, test_aggregator(), storage, cache_lifecycle, session_manager, 900);

        let req = StartSessionRequest {
            user_id: "user-1".into(),
            tier: Tier::Base,
            arxiv_ids: vec![],
            uploads: vec![],
        };

        let result = orchestrator.start_session(req).await;
        assert!(matches!(result, Err(AppError::InsufficientCredit { .. })));

        let entries: Vec<_> = std::fs::read_dir(dir.path()).unwrap().collect();
        assert!(entries.is_empty(), "no blob should have been uploaded");
    }
}
