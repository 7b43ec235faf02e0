use anyhow::Result;
use chrono::{DateTime, Utc};
use sqlx::{Pool, Postgres, Row};

use crate::models::{CacheRecord, ChatMessage, TerminationReason, TierBudget};

/// Initialize database schema.
pub async fn init_schema(pool: &Pool<Postgres>) -> Result<()> {
    // ============================================================
    // Users table — identity is extracted out-of-scope; this table is
    // the join point the core uses to key budgets and papers.
    // ============================================================
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS users (
            id TEXT PRIMARY KEY,
            created_at TIMESTAMPTZ DEFAULT NOW()
        )
        "#,
    )
    .execute(pool)
    .await?;

    // ============================================================
    // Papers & paper-references — provenance of aggregated content.
    // ============================================================
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS papers (
            id TEXT PRIMARY KEY,
            arxiv_id TEXT,
            upload_path TEXT,
            title TEXT,
            created_at TIMESTAMPTZ DEFAULT NOW()
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS paper_references (
            session_id TEXT NOT NULL,
            paper_id TEXT NOT NULL REFERENCES papers(id) ON DELETE CASCADE,
            PRIMARY KEY (session_id, paper_id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    // ============================================================
    // Chats — one header per session, final metrics written on
    // termination.
    // ============================================================
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS chats (
            session_id TEXT PRIMARY KEY,
            user_id TEXT NOT NULL,
            tier TEXT NOT NULL,
            duration_secs BIGINT,
            tokens INT,
            token_hours DOUBLE PRECISION,
            terminated_at TIMESTAMPTZ,
            created_at TIMESTAMPTZ DEFAULT NOW()
        )
        "#,
    )
    .execute(pool)
    .await?;

    // ============================================================
    // Messages — ChatMessage, producer-only from the core's perspective.
    // ============================================================
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS messages (
            id TEXT PRIMARY KEY,
            session_id TEXT NOT NULL REFERENCES chats(session_id) ON DELETE CASCADE,
            message_type TEXT NOT NULL,
            content TEXT NOT NULL,
            created_at TIMESTAMPTZ DEFAULT NOW()
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_messages_session ON messages(session_id, created_at)")
        .execute(pool)
        .await?;

    // ============================================================
    // Caches — CacheRecord, retained after termination for audit.
    // ============================================================
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS caches (
            session_id TEXT PRIMARY KEY,
            user_id TEXT NOT NULL,
            cache_name TEXT NOT NULL,
            tier TEXT NOT NULL,
            token_count INT NOT NULL,
            created_at TIMESTAMPTZ NOT NULL,
            terminated_at TIMESTAMPTZ,
            termination_reason TEXT
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_caches_user ON caches(user_id)")
        .execute(pool)
        .await?;

    // ============================================================
    // Tier budgets — composite primary key (user_id, tier).
    // ============================================================
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS tier_budgets (
            user_id TEXT NOT NULL,
            tier TEXT NOT NULL,
            token_hours_bought DOUBLE PRECISION NOT NULL DEFAULT 0,
            token_hours_used DOUBLE PRECISION NOT NULL DEFAULT 0,
            PRIMARY KEY (user_id, tier)
        )
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}

// ============================================================
// Budget Store
// ============================================================

pub async fn get_budget(pool: &Pool<Postgres>, user_id: &str, tier: &str) -> Result<Option<TierBudget>> {
    let row = sqlx::query(
        "SELECT user_id, tier, token_hours_bought, token_hours_used FROM tier_budgets WHERE user_id = $1 AND tier = $2",
    )
    .bind(user_id)
    .bind(tier)
    .fetch_optional(pool)
    .await?;

    Ok(row.map(|r| TierBudget {
        user_id: r.get("user_id"),
        tier: r.get("tier"),
        token_hours_bought: r.get("token_hours_bought"),
        token_hours_used: r.get("token_hours_used"),
    }))
}

/// Create a TierBudget row with the tier's default allocation if one
/// doesn't already exist. Idempotent.
pub async fn ensure_default_budget(
    pool: &Pool<Postgres>,
    user_id: &str,
    tier: &str,
    default_hours: f64,
) -> Result<TierBudget> {
    if let Some(existing) = get_budget(pool, user_id, tier).await? {
        return Ok(existing);
    }

    sqlx::query(
        r#"
        INSERT INTO tier_budgets (user_id, tier, token_hours_bought, token_hours_used)
        VALUES ($1, $2, $3, 0)
        ON CONFLICT (user_id, tier) DO NOTHING
        "#,
    )
    .bind(user_id)
    .bind(tier)
    .bind(default_hours)
    .execute(pool)
    .await?;

    get_budget(pool, user_id, tier)
        .await?
        .ok_or_else(|| anyhow::anyhow!("budget row vanished immediately after insert"))
}

/// `bought += delta`. Creates the row if absent.
pub async fn topup_budget(pool: &Pool<Postgres>, user_id: &str, tier: &str, delta_hours: f64) -> Result<TierBudget> {
    sqlx::query(
        r#"
        INSERT INTO tier_budgets (user_id, tier, token_hours_bought, token_hours_used)
        VALUES ($1, $2, $3, 0)
        ON CONFLICT (user_id, tier)
        DO UPDATE SET token_hours_bought = tier_budgets.token_hours_bought + EXCLUDED.token_hours_bought
        "#,
    )
    .bind(user_id)
    .bind(tier)
    .bind(delta_hours)
    .execute(pool)
    .await?;

    get_budget(pool, user_id, tier)
        .await?
        .ok_or_else(|| anyhow::anyhow!("budget row vanished immediately after topup"))
}

/// `used = min(bought, used + delta)`. Monotonic saturation, serialized
/// by the row-level transaction sqlx opens around the UPDATE.
pub async fn debit_budget(pool: &Pool<Postgres>, user_id: &str, tier: &str, delta_hours: f64) -> Result<TierBudget> {
    sqlx::query(
        r#"
        UPDATE tier_budgets
        SET token_hours_used = LEAST(token_hours_bought, token_hours_used + $3)
        WHERE user_id = $1 AND tier = $2
        "#,
    )
    .bind(user_id)
    .bind(tier)
    .bind(delta_hours)
    .execute(pool)
    .await?;

    get_budget(pool, user_id, tier)
        .await?
        .ok_or_else(|| anyhow::anyhow!("debit on unknown budget ({user_id}, {tier})"))
}

// ============================================================
// Cache Registry
// ============================================================

pub async fn create_cache_record(pool: &Pool<Postgres>, record: &CacheRecord) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO caches (session_id, user_id, cache_name, tier, token_count, created_at, terminated_at)
        VALUES ($1, $2, $3, $4, $5, $6, $7)
        "#,
    )
    .bind(&record.session_id)
    .bind(&record.user_id)
    .bind(&record.cache_name)
    .bind(&record.tier)
    .bind(record.token_count)
    .bind(record.created_at)
    .bind(record.terminated_at)
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn get_cache_record(pool: &Pool<Postgres>, session_id: &str) -> Result<Option<CacheRecord>> {
    let row = sqlx::query(
        "SELECT session_id, user_id, cache_name, tier, token_count, created_at, terminated_at FROM caches WHERE session_id = $1",
    )
    .bind(session_id)
    .fetch_optional(pool)
    .await?;

    Ok(row.map(|r| CacheRecord {
        session_id: r.get("session_id"),
        user_id: r.get("user_id"),
        cache_name: r.get("cache_name"),
        tier: r.get("tier"),
        token_count: r.get("token_count"),
        created_at: r.get("created_at"),
        terminated_at: r.get("terminated_at"),
    }))
}

pub async fn mark_cache_terminated(
    pool: &Pool<Postgres>,
    session_id: &str,
    terminated_at: DateTime<Utc>,
    reason: TerminationReason,
) -> Result<()> {
    sqlx::query("UPDATE caches SET terminated_at = $2, termination_reason = $3 WHERE session_id = $1")
        .bind(session_id)
        .bind(terminated_at)
        .bind(reason.as_str())
        .execute(pool)
        .await?;
    Ok(())
}

// ============================================================
// Papers & paper references — provenance of aggregated content.
// ============================================================

pub async fn save_paper(
    pool: &Pool<Postgres>,
    paper_id: &str,
    arxiv_id: Option<&str>,
    upload_path: Option<&str>,
    title: Option<&str>,
) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO papers (id, arxiv_id, upload_path, title)
        VALUES ($1, $2, $3, $4)
        ON CONFLICT (id) DO NOTHING
        "#,
    )
    .bind(paper_id)
    .bind(arxiv_id)
    .bind(upload_path)
    .bind(title)
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn link_paper_reference(pool: &Pool<Postgres>, session_id: &str, paper_id: &str) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO paper_references (session_id, paper_id)
        VALUES ($1, $2)
        ON CONFLICT (session_id, paper_id) DO NOTHING
        "#,
    )
    .bind(session_id)
    .bind(paper_id)
    .execute(pool)
    .await?;
    Ok(())
}

// ============================================================
// Chat header / messages
// ============================================================

pub async fn create_chat_header(pool: &Pool<Postgres>, session_id: &str, user_id: &str, tier: &str) -> Result<()> {
    sqlx::query(
        "INSERT INTO chats (session_id, user_id, tier) VALUES ($1, $2, $3) ON CONFLICT (session_id) DO NOTHING",
    )
    .bind(session_id)
    .bind(user_id)
    .bind(tier)
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn record_final_metrics(
    pool: &Pool<Postgres>,
    session_id: &str,
    metrics: &crate::models::ChatFinalMetrics,
) -> Result<()> {
    sqlx::query(
        r#"
        UPDATE chats
        SET duration_secs = $2, tokens = $3, token_hours = $4, terminated_at = $5
        WHERE session_id = $1
        "#,
    )
    .bind(session_id)
    .bind(metrics.duration_secs)
    .bind(metrics.tokens)
    .bind(metrics.token_hours)
    .bind(metrics.terminated_at)
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn save_message(pool: &Pool<Postgres>, session_id: &str, message_type: &str, content: &str) -> Result<()> {
    sqlx::query("INSERT INTO messages (id, session_id, message_type, content) VALUES ($1, $2, $3, $4)")
        .bind(uuid::Uuid::new_v4().to_string())
        .bind(session_id)
        .bind(message_type)
        .bind(content)
        .execute(pool)
        .await?;
    Ok(())
}

pub async fn list_messages(pool: &Pool<Postgres>, session_id: &str) -> Result<Vec<ChatMessage>> {
    let rows = sqlx::query(
        "SELECT id, session_id, message_type, content, created_at FROM messages WHERE session_id = $1 ORDER BY created_at ASC",
    )
    .bind(session_id)
    .fetch_all(pool)
    .await?;

    Ok(rows
        .into_iter()
        .map(|r| ChatMessage {
            id: r.get("id"),
            session_id: r.get("session_id"),
            message_type: r.get("message_type"),
            content: r.get("content"),
            created_at: r.get("created_at"),
        })
        .collect())
}
