use std::time::Duration;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::models::Tier;

/// Chunk of an in-flight LLM response stream, or its terminal state.
///
/// Modeled as a lazy, finite, non-restartable sequence of content chunks
/// plus a terminal `Done`/`Error` — stream closure is never conflated with
/// success; the last provider error is carried through `Error`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamEvent {
    Content { content: String },
    Done { tokens: i32 },
    Error { message: String },
}

/// What the provider returns when a cache is created.
#[derive(Debug, Clone)]
pub struct CacheDescriptor {
    pub name: String,
    pub token_count: i32,
    pub created_at: DateTime<Utc>,
}

/// A chat binding derived from a cache, ready to stream turns against.
#[derive(Debug, Clone)]
pub struct ChatBinding {
    pub cache_name: String,
    pub model: String,
}

/// Select the provider model id for a tier. The spec only requires two
/// distinguishable tiers (§4.2, §9 open questions); this crate resolves
/// that open question concretely — see DESIGN.md.
pub fn model_for_tier(tier: Tier) -> &'static str {
    match tier {
        Tier::Pro => "research-model-high-capacity",
        Tier::Base => "research-model-economy",
    }
}

/// Thin adapter to the external LLM provider: create cache, update-TTL,
/// delete, derive a chat from cache, and stream a message against a chat
/// binding. A trait so the Session/Cache Managers can be exercised against
/// an in-memory fake in tests without a live provider.
#[async_trait]
pub trait LlmCacheClient: Send + Sync {
    async fn create_cache(&self, model: &str, content: &str, ttl: Duration) -> Result<CacheDescriptor>;
    /// Re-fetches a cache's current descriptor from the provider.
    async fn get_cache(&self, cache_name: &str) -> Result<CacheDescriptor>;
    async fn update_ttl(&self, cache_name: &str, ttl: Duration) -> Result<()>;
    /// Idempotent: deleting an already-gone cache is not an error.
    async fn delete_cache(&self, cache_name: &str) -> Result<()>;
    async fn derive_chat(&self, cache_name: &str, model: &str) -> Result<ChatBinding>;
    /// Aborts within bounded time once `cancel` fires, per §5 — every call
    /// that reaches the external provider must carry a cancellation token.
    async fn stream_message(
        &self,
        binding: &ChatBinding,
        text: &str,
        tx: mpsc::Sender<StreamEvent>,
        cancel: CancellationToken,
    ) -> Result<()>;
}

/// HTTP-based implementation against a provider that speaks the
/// cache/chat REST contract this crate expects (create/update-ttl/delete
/// cache, derive chat, NDJSON streaming chat).
pub struct HttpLlmCacheClient {
    host: String,
    client: reqwest::Client,
}

impl HttpLlmCacheClient {
    pub fn new(host: String) -> Self {
        Self {
            host,
            client: reqwest::Client::builder()
                .timeout(Duration::from_secs(300))
                .build()
                .unwrap_or_else(|_| reqwest::Client::new()),
        }
    }
}

#[derive(Deserialize)]
struct CreateCacheResponse {
    name: String,
    token_count: i32,
    created_at: DateTime<Utc>,
}

#[derive(Deserialize)]
struct DeriveChatResponse {
    model: String,
}

#[derive(Deserialize)]
struct ChatStreamChunk {
    content: Option<String>,
    done: bool,
    tokens: Option<i32>,
}

#[async_trait]
impl LlmCacheClient for HttpLlmCacheClient {
    async fn create_cache(&self, model: &str, content: &str, ttl: Duration) -> Result<CacheDescriptor> {
        let body = serde_json::json!({
            "model": model,
            "content": content,
            "ttl_secs": ttl.as_secs(),
        });

        let response = self
            .client
            .post(format!("{}/v1/caches", self.host))
            .json(&body)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            return Err(anyhow!("cache create failed ({status}): {text}"));
        }

        let parsed: CreateCacheResponse = response.json().await?;
        Ok(CacheDescriptor {
            name: parsed.name,
            token_count: parsed.token_count,
            created_at: parsed.created_at,
        })
    }

    async fn get_cache(&self, cache_name: &str) -> Result<CacheDescriptor> {
        let response = self
            .client
            .get(format!("{}/v1/caches/{}", self.host, cache_name))
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            return Err(anyhow!("cache descriptor fetch failed ({status})"));
        }

        let parsed: CreateCacheResponse = response.json().await?;
        Ok(CacheDescriptor {
            name: parsed.name,
            token_count: parsed.token_count,
            created_at: parsed.created_at,
        })
    }

    async fn update_ttl(&self, cache_name: &str, ttl: Duration) -> Result<()> {
        let body = serde_json::json!({ "ttl_secs": ttl.as_secs() });
        let response = self
            .client
            .post(format!("{}/v1/caches/{}/ttl", self.host, cache_name))
            .json(&body)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            return Err(anyhow!("cache ttl update failed ({status})"));
        }
        Ok(())
    }

    async fn delete_cache(&self, cache_name: &str) -> Result<()> {
        let response = self
            .client
            .delete(format!("{}/v1/caches/{}", self.host, cache_name))
            .send()
            .await?;

        if response.status().is_success() || response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(());
        }

        let status = response.status();
        Err(anyhow!("cache delete failed ({status})"))
    }

    async fn derive_chat(&self, cache_name: &str, model: &str) -> Result<ChatBinding> {
        let response = self
            .client
            .post(format!("{}/v1/caches/{}/chat", self.host, cache_name))
            .json(&serde_json::json!({ "model": model }))
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            return Err(anyhow!("derive chat failed ({status})"));
        }

        let parsed: DeriveChatResponse = response.json().await?;
        Ok(ChatBinding {
            cache_name: cache_name.to_string(),
            model: parsed.model,
        })
    }

    async fn stream_message(
        &self,
        binding: &ChatBinding,
        text: &str,
        tx: mpsc::Sender<StreamEvent>,
        cancel: CancellationToken,
    ) -> Result<()> {
        let body = serde_json::json!({
            "cache_name": binding.cache_name,
            "model": binding.model,
            "message": text,
            "stream": true,
        });

        let response = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                return Err(anyhow!("stream_message cancelled before provider responded"));
            }
            result = self.client.post(format!("{}/v1/chat/stream", self.host)).json(&body).send() => result?,
        };

        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            let _ = tx
                .send(StreamEvent::Error {
                    message: format!("provider error ({status}): {text}"),
                })
                .await;
            return Err(anyhow!("chat stream open failed ({status})"));
        }

        let mut stream = response.bytes_stream();
        let mut last_error: Option<String> = None;

        loop {
            let chunk = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    last_error = Some("stream_message cancelled".to_string());
                    break;
                }
                chunk = stream.next() => match chunk {
                    Some(chunk) => chunk,
                    None => break,
                },
            };

            match chunk {
                Ok(bytes) => {
                    let text = String::from_utf8_lossy(&bytes);
                    for line in text.lines() {
                        if line.trim().is_empty() {
                            continue;
                        }
                        match serde_json::from_str::<ChatStreamChunk>(line) {
                            Ok(parsed) => {
                                if let Some(content) = parsed.content {
                                    if !content.is_empty() {
                                        let _ = tx.send(StreamEvent::Content { content }).await;
                                    }
                                }
                                if parsed.done {
                                    let _ = tx
                                        .send(StreamEvent::Done {
                                            tokens: parsed.tokens.unwrap_or(0),
                                        })
                                        .await;
                                }
                            }
                            Err(e) => {
                                last_error = Some(format!("malformed stream chunk: {e}"));
                            }
                        }
                    }
                }
                Err(e) => {
                    last_error = Some(format!("stream error: {e}"));
                    let _ = tx
                        .send(StreamEvent::Error {
                            message: last_error.clone().unwrap(),
                        })
                        .await;
                    break;
                }
            }
        }

        if let Some(err) = last_error {
            return Err(anyhow!(err));
        }
        Ok(())
    }
}

/// In-memory stand-in for the provider, used by other modules' tests to
/// exercise streaming without a live endpoint.
#[cfg(test)]
pub struct FakeLlmCacheClient {
    next_descriptor: std::sync::Mutex<Option<CacheDescriptor>>,
}

#[cfg(test)]
impl FakeLlmCacheClient {
    pub fn new() -> Self {
        Self {
            next_descriptor: std::sync::Mutex::new(None),
        }
    }

    pub fn push_cache_descriptor(&self, descriptor: CacheDescriptor) {
        *self.next_descriptor.lock().unwrap() = Some(descriptor);
    }
}

#[cfg(test)]
#[async_trait]
impl LlmCacheClient for FakeLlmCacheClient {
    async fn create_cache(&self, _model: &str, _content: &str, _ttl: Duration) -> Result<CacheDescriptor> {
        self.next_descriptor
            .lock()
            .unwrap()
            .take()
            .ok_or_else(|| anyhow!("no fake cache descriptor queued"))
    }

    async fn get_cache(&self, cache_name: &str) -> Result<CacheDescriptor> {
        Ok(self
            .next_descriptor
            .lock()
            .unwrap()
            .clone()
            .unwrap_or_else(|| CacheDescriptor {
                name: cache_name.to_string(),
                token_count: 0,
                created_at: Utc::now(),
            }))
    }

    async fn update_ttl(&self, _cache_name: &str, _ttl: Duration) -> Result<()> {
        Ok(())
    }

    async fn delete_cache(&self, _cache_name: &str) -> Result<()> {
        Ok(())
    }

    async fn derive_chat(&self, cache_name: &str, model: &str) -> Result<ChatBinding> {
        Ok(ChatBinding {
            cache_name: cache_name.to_string(),
            model: model.to_string(),
        })
    }

    async fn stream_message(
        &self,
        _binding: &ChatBinding,
        _text: &str,
        tx: mpsc::Sender<StreamEvent>,
        cancel: CancellationToken,
    ) -> Result<()> {
        if cancel.is_cancelled() {
            return Err(anyhow!("stream_message cancelled"));
        }
        let _ = tx.send(StreamEvent::Content { content: "fake response".into() }).await;
        let _ = tx.send(StreamEvent::Done { tokens: 1 }).await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn model_selection_distinguishes_tiers() {
        assert_ne!(model_for_tier(Tier::Base), model_for_tier(Tier::Pro));
    }
}
