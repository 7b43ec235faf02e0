use std::time::Duration;

/// Process-wide configuration, loaded once at startup.
///
/// Every tunable named in the design's configuration table lives here.
/// There is no hidden global: `Config` is constructed once in `main` and
/// handed to every collaborator that needs it.
#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub redis_url: String,
    pub llm_provider_host: String,

    pub cache_ttl: Duration,
    pub session_timeout: Duration,
    pub grace_period: Duration,
    pub session_check_interval: Duration,
    pub cache_extend: Duration,
    pub guard_band: Duration,
    pub reaper_interval: Duration,

    pub initial_budget_base: f64,
    pub initial_budget_pro: f64,
    pub low_credit_threshold: f64,
}

impl Config {
    /// Load configuration from the environment. Missing/unparseable
    /// required values are a startup failure — the process must exit
    /// non-zero before accepting connections (see exit-code policy).
    pub fn from_env() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();

        let database_url = require_env("DATABASE_URL")?;
        let redis_url = require_env("REDIS_URL")?;
        let llm_provider_host = require_env("LLM_PROVIDER_HOST")?;

        Ok(Self {
            database_url,
            redis_url,
            llm_provider_host,

            cache_ttl: secs_env("CACHE_TTL_SECS", 15 * 60)?,
            session_timeout: secs_env("SESSION_TIMEOUT_SECS", 10 * 60)?,
            grace_period: secs_env("GRACE_PERIOD_SECS", 5 * 60)?,
            session_check_interval: secs_env("SESSION_CHECK_INTERVAL_SECS", 30)?,
            cache_extend: secs_env("CACHE_EXTEND_SECS", 5 * 60)?,
            guard_band: secs_env("GUARD_BAND_SECS", 30)?,
            reaper_interval: secs_env("REAPER_INTERVAL_SECS", 60)?,

            initial_budget_base: f64_env("INITIAL_BUDGET_BASE", 5.0)?,
            initial_budget_pro: f64_env("INITIAL_BUDGET_PRO", 2.0)?,
            low_credit_threshold: f64_env("LOW_CREDIT_THRESHOLD", 0.1)?,
        })
    }
}

fn require_env(key: &str) -> anyhow::Result<String> {
    std::env::var(key).map_err(|_| anyhow::anyhow!("missing required configuration: {key}"))
}

fn secs_env(key: &str, default_secs: u64) -> anyhow::Result<Duration> {
    match std::env::var(key) {
        Ok(v) => {
            let secs: u64 = v
                .parse()
                .map_err(|_| anyhow::anyhow!("{key} must be an integer number of seconds"))?;
            Ok(Duration::from_secs(secs))
        }
        Err(_) => Ok(Duration::from_secs(default_secs)),
    }
}

fn f64_env(key: &str, default: f64) -> anyhow::Result<f64> {
    match std::env::var(key) {
        Ok(v) => v
            .parse()
            .map_err(|_| anyhow::anyhow!("{key} must be a floating point number")),
        Err(_) => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn secs_env_falls_back_to_default() {
        std::env::remove_var("TEST_UNSET_DURATION");
        let d = secs_env("TEST_UNSET_DURATION", 42).unwrap();
        assert_eq!(d, Duration::from_secs(42));
    }

    #[test]
    fn f64_env_falls_back_to_default() {
        std::env::remove_var("TEST_UNSET_FLOAT");
        let v = f64_env("TEST_UNSET_FLOAT", 0.25).unwrap();
        assert_eq!(v, 0.25);
    }
}
