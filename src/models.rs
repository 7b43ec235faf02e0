use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A pricing tier. Each tier has an independent budget and an independent
/// model selection (the exact mapping to a provider model id is left to
/// `llm::model_for_tier` — the spec only requires two distinguishable
/// tiers, see DESIGN.md open questions).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Tier {
    Base,
    Pro,
}

impl Tier {
    pub fn as_str(&self) -> &'static str {
        match self {
            Tier::Base => "base",
            Tier::Pro => "pro",
        }
    }
}

impl std::str::FromStr for Tier {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "base" => Ok(Tier::Base),
            "pro" => Ok(Tier::Pro),
            other => Err(format!("unknown tier '{other}'")),
        }
    }
}

impl std::fmt::Display for Tier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Reason a session was terminated, persisted on the CacheRecord.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TerminationReason {
    UserInitiated,
    SessionTimeout,
}

impl TerminationReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            TerminationReason::UserInitiated => "user_initiated",
            TerminationReason::SessionTimeout => "session_timeout",
        }
    }
}

/// A session's externally-observable status, as returned by CheckStatus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Active,
    Warning,
    Expired,
}

/// CacheRecord — audit row for a remote cache's lifetime and billing.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct CacheRecord {
    pub user_id: String,
    pub session_id: String,
    pub cache_name: String,
    pub tier: String,
    pub token_count: i32,
    pub created_at: DateTime<Utc>,
    pub terminated_at: Option<DateTime<Utc>>,
}

/// TierBudget — per-(user, tier) prepaid/used token-hours.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct TierBudget {
    pub user_id: String,
    pub tier: String,
    pub token_hours_bought: f64,
    pub token_hours_used: f64,
}

impl TierBudget {
    pub fn remaining(&self) -> f64 {
        (self.token_hours_bought - self.token_hours_used).max(0.0)
    }

    pub fn is_exhausted(&self) -> bool {
        self.token_hours_used >= self.token_hours_bought
    }

    pub fn is_low(&self, threshold: f64) -> bool {
        if self.token_hours_bought <= 0.0 {
            return true;
        }
        self.remaining() / self.token_hours_bought <= threshold
    }
}

/// ChatMessage — one turn of a chat, as persisted by the external
/// collaborator. The core is a producer only.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct ChatMessage {
    pub id: String,
    pub session_id: String,
    #[sqlx(rename = "message_type")]
    pub message_type: String, // "user" | "ai"
    pub content: String,
    pub created_at: DateTime<Utc>,
}

/// Final metrics recorded on a ChatHeader when a session terminates.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatFinalMetrics {
    pub duration_secs: i64,
    pub tokens: i32,
    pub tier: String,
    pub token_hours: f64,
    pub terminated_at: DateTime<Utc>,
}

// ============================================================
// Client <-> server frame format (both directions, JSON)
// ============================================================

/// Inbound frame from the client.
#[derive(Debug, Clone, Deserialize)]
pub struct ClientFrame {
    #[serde(rename = "type")]
    pub frame_type: String,
    #[serde(default)]
    pub content: String,
    #[serde(rename = "sessionId", default)]
    pub session_id: String,
}

/// Recognized inbound frame types.
pub mod inbound {
    pub const MESSAGE: &str = "message";
    pub const TERMINATE: &str = "terminate";
    pub const GET_SESSION_STATUS: &str = "get_session_status";
    pub const EXTEND_SESSION: &str = "extend_session";
}

/// Outbound frame to the client. `content` carries either plain text or a
/// JSON-stringified payload depending on `frame_type` (documented per
/// variant below; the client is not expected to duck-type this).
#[derive(Debug, Clone, Serialize)]
pub struct ServerFrame {
    #[serde(rename = "type")]
    pub frame_type: String,
    pub content: String,
    #[serde(rename = "sessionId")]
    pub session_id: String,
}

impl ServerFrame {
    /// `{type:ai, content:<token or "[END]">}`
    pub fn ai(session_id: &str, content: impl Into<String>) -> Self {
        Self {
            frame_type: "ai".to_string(),
            content: content.into(),
            session_id: session_id.to_string(),
        }
    }

    /// `{type:session_status, content:<JSON-stringified status>}`
    pub fn session_status(session_id: &str, status: SessionStatus) -> Self {
        let content = serde_json::json!({ "status": status }).to_string();
        Self {
            frame_type: "session_status".to_string(),
            content,
            session_id: session_id.to_string(),
        }
    }

    /// `{type:credit_warning, content:{"remainingCredit": <float>}}`
    pub fn credit_warning(session_id: &str, remaining_credit: f64) -> Self {
        let content = serde_json::json!({ "remainingCredit": remaining_credit }).to_string();
        Self {
            frame_type: "credit_warning".to_string(),
            content,
            session_id: session_id.to_string(),
        }
    }

    pub fn credit_update(session_id: &str, content: impl Into<String>) -> Self {
        Self {
            frame_type: "credit_update".to_string(),
            content: content.into(),
            session_id: session_id.to_string(),
        }
    }

    pub fn expired(session_id: &str) -> Self {
        Self {
            frame_type: "expired".to_string(),
            content: String::new(),
            session_id: session_id.to_string(),
        }
    }

    pub fn info(session_id: &str, content: impl Into<String>) -> Self {
        Self {
            frame_type: "info".to_string(),
            content: content.into(),
            session_id: session_id.to_string(),
        }
    }

    pub fn error(session_id: &str, message: impl Into<String>) -> Self {
        Self {
            frame_type: "error".to_string(),
            content: message.into(),
            session_id: session_id.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tier_budget_saturates_remaining_at_zero() {
        let b = TierBudget {
            user_id: "u".into(),
            tier: "base".into(),
            token_hours_bought: 1.0,
            token_hours_used: 1.5,
        };
        assert_eq!(b.remaining(), 0.0);
        assert!(b.is_exhausted());
    }

    #[test]
    fn tier_budget_low_credit_threshold() {
        let b = TierBudget {
            user_id: "u".into(),
            tier: "base".into(),
            token_hours_bought: 1.0,
            token_hours_used: 0.95,
        };
        assert!(b.is_low(0.1));
        assert!(!b.is_low(0.01));
    }

    #[test]
    fn tier_round_trips_through_str() {
        assert_eq!("base".parse::<Tier>().unwrap(), Tier::Base);
        assert_eq!("pro".parse::<Tier>().unwrap(), Tier::Pro);
        assert!("enterprise".parse::<Tier>().is_err());
    }

    #[test]
    fn server_frame_session_status_embeds_json() {
        let frame = ServerFrame::session_status("s1", SessionStatus::Warning);
        assert_eq!(frame.frame_type, "session_status");
        assert!(frame.content.contains("warning"));
    }
}
