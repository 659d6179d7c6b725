//! Asynchronous two-tier triage pipeline.
//!
//! Tier 1 scores pre-computed bucket summaries; tier 2 pulls the raw
//! events behind every flagged bucket and classifies them into findings.
//! Both tiers use schema-constrained LLM output, and both filter the
//! model's references back against what actually exists: bucket ids
//! against the summaries that were shown, event ids against the events
//! that were scanned. Hallucinated references are dropped and logged,
//! never surfaced.
//!
//! Jobs are cached under two keys (by id and by a digest of the time
//! range) so identical submissions within the TTL return the same job.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use opentelemetry::KeyValue;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::cache::{self, Cache, RESPONSE_TTL};
use crate::db::Db;
use crate::error::{Error, Result};
use crate::llm::{LlmError, LlmGateway};
use crate::model::TimeRange;
use crate::prompts::{time_fmt, PromptLibrary};
use crate::telemetry::metrics;

/// A job still `pending` after this long is considered dead on read.
const PENDING_TIMEOUT_SECS: i64 = 120;
const TIER1_SUMMARY_LIMIT: i64 = 50;
const TIER2_EVENT_LIMIT: i64 = 100;

// ---------------------------------------------------------------------------
// Job model
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Running,
    Complete,
    Failed,
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Complete => "complete",
            JobStatus::Failed => "failed",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TriageJob {
    pub id: String,
    pub time_range: TimeRange,
    pub status: JobStatus,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub error: String,
    pub created_at: DateTime<Utc>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tier1: Option<Tier1Result>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub findings: Option<Vec<TriageFinding>>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub scanned_event_ids: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Tier1Result {
    #[serde(default)]
    pub summary: String,
    #[serde(default)]
    pub high_risk: Vec<BucketRisk>,
    #[serde(default)]
    pub medium_risk: Vec<BucketRisk>,
    #[serde(default)]
    pub low_risk: Vec<BucketRisk>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BucketRisk {
    pub bucket_id: String,
    #[serde(default)]
    pub reason: String,
    #[serde(default)]
    pub confidence: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Priority {
    P1,
    P2,
    P3,
    P4,
    P5,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TriageFinding {
    pub priority: Priority,
    pub category: String,
    pub summary: String,
    #[serde(default)]
    pub event_ids: Vec<String>,
}

// ---------------------------------------------------------------------------
// Structured-output schemas (provider format)
// ---------------------------------------------------------------------------

fn bucket_risk_schema() -> serde_json::Value {
    json!({
        "type": "OBJECT",
        "properties": {
            "bucket_id": {"type": "STRING", "description": "RFC3339 timestamp of bucket"},
            "reason": {"type": "STRING", "description": "Why this risk level"},
            "confidence": {"type": "NUMBER", "description": "Confidence 0.0-1.0"},
        },
        "required": ["bucket_id", "reason", "confidence"],
    })
}

pub(crate) fn tier1_schema() -> serde_json::Value {
    json!({
        "type": "OBJECT",
        "properties": {
            "summary": {"type": "STRING", "description": "Brief overall assessment"},
            "high_risk": {"type": "ARRAY", "items": bucket_risk_schema()},
            "medium_risk": {"type": "ARRAY", "items": bucket_risk_schema()},
            "low_risk": {"type": "ARRAY", "items": bucket_risk_schema()},
        },
        "required": ["summary", "high_risk", "medium_risk", "low_risk"],
    })
}

pub(crate) fn tier2_schema() -> serde_json::Value {
    json!({
        "type": "ARRAY",
        "items": {
            "type": "OBJECT",
            "properties": {
                "priority": {
                    "type": "STRING",
                    "description": "Incident priority level",
                    "enum": ["P1", "P2", "P3", "P4", "P5"],
                },
                "category": {"type": "STRING", "description": "Threat category"},
                "summary": {"type": "STRING", "description": "Finding description"},
                "event_ids": {
                    "type": "ARRAY",
                    "items": {"type": "STRING"},
                    "description": "Event IDs supporting this finding as evidence",
                },
            },
            "required": ["priority", "category", "summary"],
        },
    })
}

// ---------------------------------------------------------------------------
// Orchestrator
// ---------------------------------------------------------------------------

/// Outcome of submitting a triage request.
#[derive(Debug)]
pub enum SubmitOutcome {
    /// A new job was created and its background task spawned.
    Created { job_id: String, status: JobStatus },
    /// An identical time range was submitted within the TTL.
    Existing(TriageJob),
}

pub struct TriageOrchestrator {
    db: Arc<Db>,
    cache: Arc<Cache>,
    gateway: Option<Arc<LlmGateway>>,
    prompts: Arc<PromptLibrary>,
    bucket_width: chrono::Duration,
}

impl TriageOrchestrator {
    pub fn new(
        db: Arc<Db>,
        cache: Arc<Cache>,
        gateway: Option<Arc<LlmGateway>>,
        prompts: Arc<PromptLibrary>,
        bucket_width: chrono::Duration,
    ) -> Self {
        Self {
            db,
            cache,
            gateway,
            prompts,
            bucket_width,
        }
    }

    /// Create a job for the range, or return the existing one unchanged
    /// when an identical range was submitted within the TTL.
    pub fn submit(self: &Arc<Self>, time_range: TimeRange) -> Result<SubmitOutcome> {
        time_range.validate()?;

        let range_key = cache::triage_range_key(&time_range)
            .ok_or_else(|| Error::Internal("failed to derive triage cache key".to_string()))?;

        if let Some(existing) = self.lookup_by_range_key(&range_key) {
            return Ok(SubmitOutcome::Existing(existing));
        }

        let job = TriageJob {
            id: Uuid::new_v4().to_string(),
            time_range,
            status: JobStatus::Pending,
            error: String::new(),
            created_at: Utc::now(),
            tier1: None,
            findings: None,
            scanned_event_ids: Vec::new(),
        };
        self.store_job(&job, &range_key)?;

        info!(job_id = %job.id, "triage job created");
        self.spawn_job(job.clone(), range_key);

        Ok(SubmitOutcome::Created {
            job_id: job.id,
            status: job.status,
        })
    }

    /// Fetch a job by id, coercing a pending job older than the timeout to
    /// failed before returning it. Running jobs are left alone.
    pub fn get(&self, job_id: &str) -> Option<TriageJob> {
        let mut job = self.lookup_job(job_id)?;

        let age = Utc::now() - job.created_at;
        if job.status == JobStatus::Pending && age > chrono::Duration::seconds(PENDING_TIMEOUT_SECS)
        {
            job.status = JobStatus::Failed;
            job.error = "job timed out".to_string();
            if let Some(range_key) = cache::triage_range_key(&job.time_range) {
                if let Err(e) = self.store_job(&job, &range_key) {
                    warn!(error = %e, job_id, "failed to persist timed-out job");
                }
            }
        }

        Some(job)
    }

    /// Background execution survives the HTTP request: the worker runs in
    /// its own task, and an outer task watches it so a panic still lands
    /// the job in `failed` instead of leaving it `running` forever.
    fn spawn_job(self: &Arc<Self>, job: TriageJob, range_key: String) {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            let worker = {
                let this = Arc::clone(&this);
                let job = job.clone();
                let range_key = range_key.clone();
                tokio::spawn(async move { this.run_job(job, range_key).await })
            };

            if let Err(join_err) = worker.await {
                error!(job_id = %job.id, error = %join_err, "triage job panicked");
                let mut failed = this.lookup_job(&job.id).unwrap_or(job);
                failed.status = JobStatus::Failed;
                failed.error = "internal error".to_string();
                if let Err(e) = this.store_job(&failed, &range_key) {
                    warn!(error = %e, job_id = %failed.id, "failed to persist failed job");
                }
            }
        });
    }

    async fn run_job(&self, mut job: TriageJob, range_key: String) {
        job.status = JobStatus::Running;
        self.store_job_logged(&job, &range_key);

        let (mut tier1, valid_buckets) = match self.run_tier1(&job.time_range).await {
            Ok(out) => out,
            Err(e) => {
                error!(job_id = %job.id, error = %e, "tier 1 failed");
                self.finish_failed(&mut job, &range_key, "tier 1 analysis failed");
                return;
            }
        };

        tier1.high_risk = filter_valid_buckets(tier1.high_risk, &valid_buckets);
        tier1.medium_risk = filter_valid_buckets(tier1.medium_risk, &valid_buckets);

        let flagged: Vec<BucketRisk> = tier1
            .high_risk
            .iter()
            .chain(tier1.medium_risk.iter())
            .cloned()
            .collect();
        job.tier1 = Some(tier1);

        if flagged.is_empty() {
            self.finish_complete(&mut job, &range_key);
            return;
        }

        let (findings, scanned_ids) = match self.run_tier2(&flagged).await {
            Ok(out) => out,
            Err(e) => {
                error!(job_id = %job.id, error = %e, "tier 2 failed");
                self.finish_failed(&mut job, &range_key, "tier 2 analysis failed");
                return;
            }
        };

        job.findings = Some(findings);
        job.scanned_event_ids = scanned_ids;
        self.finish_complete(&mut job, &range_key);
    }

    /// Score summary buckets in the range. Returns the parsed result plus
    /// the set of bucket ids that actually exist, for hallucination
    /// filtering.
    async fn run_tier1(&self, range: &TimeRange) -> Result<(Tier1Result, HashSet<String>)> {
        let summaries = self
            .db
            .fetch_summaries(Some(range), TIER1_SUMMARY_LIMIT)
            .await?;

        if summaries.is_empty() {
            let empty = Tier1Result {
                summary: "No events found in time range".to_string(),
                ..Default::default()
            };
            return Ok((empty, HashSet::new()));
        }

        let valid_buckets: HashSet<String> = summaries
            .iter()
            .map(|s| time_fmt(s.bucket_start))
            .collect();

        let gateway = self.gateway.as_ref().ok_or(Error::Llm(LlmError::NotConfigured))?;
        let prompt = self.prompts.render_tier1(&summaries);
        let response = gateway.generate(&prompt, Some(tier1_schema())).await?;

        let result: Tier1Result = serde_json::from_str(&response)
            .map_err(|e| Error::Internal(format!("failed to parse tier 1 response: {e}")))?;

        Ok((result, valid_buckets))
    }

    /// Classify the raw events behind every flagged bucket. Returns the
    /// findings (with hallucinated event ids dropped) and the full scanned
    /// id set.
    async fn run_tier2(
        &self,
        flagged: &[BucketRisk],
    ) -> Result<(Vec<TriageFinding>, Vec<String>)> {
        let mut all_events = Vec::new();
        let mut all_ids: Vec<String> = Vec::new();

        for bucket in flagged {
            let bucket_start = match DateTime::parse_from_rfc3339(&bucket.bucket_id) {
                Ok(ts) => ts.with_timezone(&Utc),
                Err(_) => continue,
            };

            let range = TimeRange {
                start: bucket_start,
                end: bucket_start + self.bucket_width,
            };
            match self.db.fetch_events(Some(&range), TIER2_EVENT_LIMIT).await {
                Ok(events) => {
                    for event in events {
                        all_ids.push(event.id.clone());
                        all_events.push(event);
                    }
                }
                Err(e) => {
                    warn!(bucket = %bucket.bucket_id, error = %e, "failed to fetch events for bucket");
                    continue;
                }
            }
        }

        if all_events.is_empty() {
            return Ok((Vec::new(), Vec::new()));
        }

        let gateway = self.gateway.as_ref().ok_or(Error::Llm(LlmError::NotConfigured))?;
        let prompt = self.prompts.render_tier2(&all_events);
        let response = gateway.generate(&prompt, Some(tier2_schema())).await?;

        let mut findings: Vec<TriageFinding> = serde_json::from_str(&response)
            .map_err(|e| Error::Internal(format!("failed to parse tier 2 response: {e}")))?;

        let valid_ids: HashSet<&str> = all_ids.iter().map(String::as_str).collect();
        for finding in &mut findings {
            finding.event_ids = filter_valid_ids(std::mem::take(&mut finding.event_ids), &valid_ids);
        }

        Ok((findings, all_ids))
    }

    fn finish_complete(&self, job: &mut TriageJob, range_key: &str) {
        job.status = JobStatus::Complete;
        self.store_job_logged(job, range_key);
        metrics::triage_jobs().add(1, &[KeyValue::new("status", "complete")]);
        info!(job_id = %job.id, "triage job complete");
    }

    fn finish_failed(&self, job: &mut TriageJob, range_key: &str, message: &str) {
        job.status = JobStatus::Failed;
        job.error = message.to_string();
        self.store_job_logged(job, range_key);
        metrics::triage_jobs().add(1, &[KeyValue::new("status", "failed")]);
    }

    fn store_job_logged(&self, job: &TriageJob, range_key: &str) {
        if let Err(e) = self.store_job(job, range_key) {
            warn!(error = %e, job_id = %job.id, "failed to persist triage job");
        }
    }

    /// Persist under both keys in one shot.
    fn store_job(&self, job: &TriageJob, range_key: &str) -> Result<()> {
        let raw = serde_json::to_string(job)?;
        self.cache.put_many(
            vec![
                (cache::triage_job_key(&job.id), raw),
                (range_key.to_string(), job.id.clone()),
            ],
            RESPONSE_TTL,
        );
        Ok(())
    }

    fn lookup_job(&self, job_id: &str) -> Option<TriageJob> {
        let raw = self.cache.get(&cache::triage_job_key(job_id))?;
        serde_json::from_str(&raw).ok()
    }

    fn lookup_by_range_key(&self, range_key: &str) -> Option<TriageJob> {
        let job_id = self.cache.get(range_key)?;
        self.lookup_job(&job_id)
    }
}

fn filter_valid_buckets(buckets: Vec<BucketRisk>, valid: &HashSet<String>) -> Vec<BucketRisk> {
    buckets
        .into_iter()
        .filter(|bucket| {
            let known = valid.contains(&bucket.bucket_id);
            if !known {
                warn!(bucket = %bucket.bucket_id, "dropping hallucinated bucket id");
            }
            known
        })
        .collect()
}

fn filter_valid_ids(ids: Vec<String>, valid: &HashSet<&str>) -> Vec<String> {
    ids.into_iter()
        .filter(|id| {
            let known = valid.contains(id.as_str());
            if !known {
                warn!(event_id = %id, "dropping hallucinated event id");
            }
            known
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn risk(bucket_id: &str) -> BucketRisk {
        BucketRisk {
            bucket_id: bucket_id.to_string(),
            reason: "suspicious".to_string(),
            confidence: 0.9,
        }
    }

    #[test]
    fn filter_valid_buckets_drops_unknown_ids() {
        let valid: HashSet<String> = [
            "2026-01-01T00:00:00Z".to_string(),
            "2026-01-01T01:00:00Z".to_string(),
        ]
        .into();

        let buckets = vec![
            risk("2026-01-01T00:00:00Z"),
            risk("hallucinated-by-llm"),
            risk("2026-01-01T01:00:00Z"),
        ];

        let kept = filter_valid_buckets(buckets, &valid);
        assert_eq!(kept.len(), 2);
        assert!(kept.iter().all(|b| valid.contains(&b.bucket_id)));
    }

    #[test]
    fn filter_valid_buckets_with_empty_set_drops_everything() {
        let kept = filter_valid_buckets(vec![risk("anything")], &HashSet::new());
        assert!(kept.is_empty());
    }

    #[test]
    fn filter_valid_ids_keeps_order_of_known_ids() {
        let valid: HashSet<&str> = ["evt-1", "evt-2"].into();
        let ids = vec![
            "evt-1".to_string(),
            "hallucinated".to_string(),
            "evt-2".to_string(),
        ];
        assert_eq!(
            filter_valid_ids(ids, &valid),
            vec!["evt-1".to_string(), "evt-2".to_string()]
        );
    }

    #[test]
    fn tier_schemas_declare_required_fields() {
        let t1 = tier1_schema();
        assert_eq!(t1["type"], "OBJECT");
        let required: Vec<&str> = t1["required"]
            .as_array()
            .unwrap()
            .iter()
            .map(|v| v.as_str().unwrap())
            .collect();
        assert_eq!(required, vec!["summary", "high_risk", "medium_risk", "low_risk"]);

        let t2 = tier2_schema();
        assert_eq!(t2["type"], "ARRAY");
        assert_eq!(
            t2["items"]["properties"]["priority"]["enum"],
            json!(["P1", "P2", "P3", "P4", "P5"])
        );
    }

    #[test]
    fn job_serde_round_trips_with_optional_sections() {
        let job = TriageJob {
            id: "7b1c".to_string(),
            time_range: TimeRange {
                start: Utc::now() - chrono::Duration::hours(1),
                end: Utc::now(),
            },
            status: JobStatus::Complete,
            error: String::new(),
            created_at: Utc::now(),
            tier1: Some(Tier1Result {
                summary: "quiet".to_string(),
                ..Default::default()
            }),
            findings: Some(vec![TriageFinding {
                priority: Priority::P2,
                category: "bruteforce".to_string(),
                summary: "repeated failures".to_string(),
                event_ids: vec!["evt-1".to_string()],
            }]),
            scanned_event_ids: vec!["evt-1".to_string()],
        };

        let raw = serde_json::to_string(&job).unwrap();
        assert!(!raw.contains("\"error\""));
        let back: TriageJob = serde_json::from_str(&raw).unwrap();
        assert_eq!(back.status, JobStatus::Complete);
        assert_eq!(back.findings.unwrap()[0].priority, Priority::P2);
    }

    #[test]
    fn tier1_result_parses_partial_llm_output() {
        // Schema-constrained output should carry all fields, but parsing
        // stays tolerant of absent arrays.
        let raw = r#"{"summary": "all quiet", "high_risk": [], "medium_risk": [], "low_risk": []}"#;
        let parsed: Tier1Result = serde_json::from_str(raw).unwrap();
        assert!(parsed.high_risk.is_empty());

        let sparse: Tier1Result = serde_json::from_str(r#"{"summary": "x"}"#).unwrap();
        assert!(sparse.low_risk.is_empty());
    }
}
