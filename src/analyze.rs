//! Interactive analyze flow: one-shot Q&A over a window of events.

use std::sync::Arc;

use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::cache::{self, Cache, RESPONSE_TTL};
use crate::db::Db;
use crate::error::{Error, Result};
use crate::llm::LlmGateway;
use crate::model::TimeRange;
use crate::prompts::PromptLibrary;

/// Upper bound on sample event ids returned with a response.
const SAMPLE_EVENTS: usize = 5;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalyzeRequest {
    pub question: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_events: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time_range: Option<TimeRange>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalyzeResponse {
    pub answer: String,
    pub events_used: usize,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub sample_events: Vec<String>,
    #[serde(default)]
    pub cached: bool,
}

pub struct Analyzer {
    db: Arc<Db>,
    cache: Arc<Cache>,
    gateway: Option<Arc<LlmGateway>>,
    prompts: Arc<PromptLibrary>,
    max_events: i64,
}

impl Analyzer {
    pub fn new(
        db: Arc<Db>,
        cache: Arc<Cache>,
        gateway: Option<Arc<LlmGateway>>,
        prompts: Arc<PromptLibrary>,
        max_events: i64,
    ) -> Self {
        Self {
            db,
            cache,
            gateway,
            prompts,
            max_events,
        }
    }

    pub async fn analyze(&self, req: AnalyzeRequest) -> Result<AnalyzeResponse> {
        if req.question.trim().is_empty() {
            return Err(Error::InvalidField("question is required".to_string()));
        }
        if let Some(range) = &req.time_range {
            range.validate()?;
        }

        let max_events = match req.max_events {
            Some(n) if n > 0 && n <= self.max_events => n,
            _ => self.max_events,
        };

        let cache_key = cache::digest_key("analyze", &req);
        if let Some(key) = &cache_key {
            if let Some(raw) = self.cache.get(key) {
                match serde_json::from_str::<AnalyzeResponse>(&raw) {
                    Ok(mut cached) => {
                        cached.cached = true;
                        return Ok(cached);
                    }
                    Err(e) => warn!(error = %e, key, "failed to decode cached response"),
                }
            }
        }

        let events = self.db.fetch_events(req.time_range.as_ref(), max_events).await?;

        let answer = match &self.gateway {
            Some(gateway) => {
                let prompt = self.prompts.render_analyze(&req.question, &events);
                info!(
                    model = %prompt.config.model,
                    events = events.len(),
                    "calling LLM"
                );
                gateway.generate(&prompt, None).await?
            }
            None => format!("Analyzed {} events. (LLM unavailable)", events.len()),
        };

        let mut sample_events: Vec<String> = events.iter().map(|e| e.id.clone()).collect();
        sample_events.shuffle(&mut rand::thread_rng());
        sample_events.truncate(SAMPLE_EVENTS);

        let response = AnalyzeResponse {
            answer,
            events_used: events.len(),
            sample_events,
            cached: false,
        };

        // Stub answers (no provider) are not worth caching.
        if self.gateway.is_some() {
            if let Some(key) = cache_key {
                match serde_json::to_string(&response) {
                    Ok(raw) => self.cache.put(key, raw, RESPONSE_TTL),
                    Err(e) => warn!(error = %e, "failed to serialize response for caching"),
                }
            }
        }

        Ok(response)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_digest_is_stable_across_identical_requests() {
        let req = AnalyzeRequest {
            question: "any failed logins?".to_string(),
            max_events: Some(25),
            time_range: None,
        };
        let again = req.clone();
        assert_eq!(
            cache::digest_key("analyze", &req),
            cache::digest_key("analyze", &again)
        );
    }

    #[test]
    fn request_digest_differs_by_question() {
        let a = AnalyzeRequest {
            question: "a".to_string(),
            max_events: None,
            time_range: None,
        };
        let b = AnalyzeRequest {
            question: "b".to_string(),
            max_events: None,
            time_range: None,
        };
        assert_ne!(
            cache::digest_key("analyze", &a),
            cache::digest_key("analyze", &b)
        );
    }
}
