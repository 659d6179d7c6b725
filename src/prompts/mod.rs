//! Versioned prompt template library.
//!
//! Templates are embedded markdown assets: YAML frontmatter (model and
//! generation settings) between `---` delimiters, then a body with
//! `<!-- system -->` and `<!-- user -->` sections. A template without a
//! model is a fatal load error. Rendering substitutes `{{name}}`
//! placeholders with pre-formatted blocks.

use serde::Deserialize;
use tracing::info;

use crate::error::{Error, Result};
use crate::model::{Event, EventSummary};

/// Template-level cap on events included in a prompt; the remainder only
/// contribute to the overflow note.
pub const PROMPT_EVENTS_LIMIT: usize = 50;

const ANALYZE_TEMPLATE: &str = include_str!("../../prompts/analyze.md");
const TIER1_TEMPLATE: &str = include_str!("../../prompts/triage_tier1.md");
const TIER2_TEMPLATE: &str = include_str!("../../prompts/triage_tier2.md");

const PAYLOAD_MAX_LEN: usize = 200;

#[derive(Debug, Clone, Deserialize)]
pub struct PromptConfig {
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub description: Option<String>,

    #[serde(default)]
    pub model: String,
    #[serde(default)]
    pub temperature: Option<f32>,
    #[serde(default)]
    pub max_output_tokens: Option<i32>,
    #[serde(default)]
    pub stop_sequences: Option<Vec<String>>,

    #[serde(default)]
    pub input_variables: Vec<PromptInput>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PromptInput {
    pub name: String,
    #[serde(default)]
    pub desc: String,
}

/// A loaded template. Immutable after load.
#[derive(Debug, Clone)]
pub struct PromptTemplate {
    pub config: PromptConfig,
    system: String,
    user: String,
}

/// A rendered prompt ready for the gateway.
#[derive(Debug, Clone)]
pub struct PromptPair {
    pub system: String,
    pub user: String,
    pub config: PromptConfig,
}

pub struct PromptLibrary {
    analyze: PromptTemplate,
    tier1: PromptTemplate,
    tier2: PromptTemplate,
}

impl PromptLibrary {
    /// Load all embedded templates. Called once at startup.
    pub fn load() -> Result<Self> {
        Ok(Self {
            analyze: PromptTemplate::parse("analyze", ANALYZE_TEMPLATE)?,
            tier1: PromptTemplate::parse("triage_tier1", TIER1_TEMPLATE)?,
            tier2: PromptTemplate::parse("triage_tier2", TIER2_TEMPLATE)?,
        })
    }

    /// Render the analyze prompt. Events beyond [`PROMPT_EVENTS_LIMIT`]
    /// are dropped from the body and surface only as an overflow note.
    pub fn render_analyze(&self, question: &str, events: &[Event]) -> PromptPair {
        let shown = &events[..events.len().min(PROMPT_EVENTS_LIMIT)];
        let overflow = events.len() - shown.len();
        let overflow_note = if overflow > 0 {
            format!("({overflow} additional events matched but are omitted.)")
        } else {
            String::new()
        };

        self.analyze.render(&[
            ("events", &format_events(shown)),
            ("overflow", &overflow_note),
            ("question", question),
        ])
    }

    pub fn render_tier1(&self, summaries: &[EventSummary]) -> PromptPair {
        self.tier1
            .render(&[("summaries", &format_summaries(summaries))])
    }

    pub fn render_tier2(&self, events: &[Event]) -> PromptPair {
        self.tier2.render(&[("events", &format_events(events))])
    }
}

impl PromptTemplate {
    fn parse(name: &str, raw: &str) -> Result<Self> {
        let (frontmatter, body) = split_frontmatter(raw)
            .ok_or_else(|| Error::Template(format!("{name}: missing frontmatter")))?;

        let config: PromptConfig = serde_yaml::from_str(frontmatter)
            .map_err(|e| Error::Template(format!("{name}: bad frontmatter: {e}")))?;
        if config.model.trim().is_empty() {
            return Err(Error::Template(format!("{name}: prompt config missing model")));
        }

        let (system, user) = split_sections(body)
            .ok_or_else(|| Error::Template(format!("{name}: missing user section")))?;

        info!(
            name,
            version = config.version.as_deref().unwrap_or(""),
            description = config.description.as_deref().unwrap_or(""),
            "loaded prompt"
        );

        Ok(Self { config, system, user })
    }

    fn render(&self, vars: &[(&str, &str)]) -> PromptPair {
        let substitute = |template: &str| {
            let mut out = template.to_string();
            for (name, value) in vars {
                out = out.replace(&format!("{{{{{name}}}}}"), value);
            }
            out.trim().to_string()
        };

        PromptPair {
            system: substitute(&self.system),
            user: substitute(&self.user),
            config: self.config.clone(),
        }
    }
}

fn split_frontmatter(input: &str) -> Option<(&str, &str)> {
    let rest = input.strip_prefix("---\n")?;
    let end = rest.find("\n---\n")?;
    Some((&rest[..end], &rest[end + 5..]))
}

fn split_sections(body: &str) -> Option<(String, String)> {
    const SYSTEM_MARK: &str = "<!-- system -->";
    const USER_MARK: &str = "<!-- user -->";

    let user_at = body.find(USER_MARK)?;
    let user = body[user_at + USER_MARK.len()..].trim().to_string();
    let system = match body.find(SYSTEM_MARK) {
        Some(at) if at < user_at => body[at + SYSTEM_MARK.len()..user_at].trim().to_string(),
        _ => String::new(),
    };
    Some((system, user))
}

/// RFC3339 with a trailing `Z`; the same formatting feeds the prompts and
/// the triage bucket-id validation set, so they can never disagree.
pub fn time_fmt(ts: chrono::DateTime<chrono::Utc>) -> String {
    ts.to_rfc3339_opts(chrono::SecondsFormat::Secs, true)
}

/// Shorten a JSON value for prompt inclusion, with an ellipsis.
pub fn truncate(value: &serde_json::Value, max_len: usize) -> String {
    match value {
        serde_json::Value::Null => "{}".to_string(),
        serde_json::Value::Object(map) if map.is_empty() => "{}".to_string(),
        serde_json::Value::String(s) if s.is_empty() => "{}".to_string(),
        serde_json::Value::String(s) => truncate_str(s, max_len),
        other => truncate_str(
            &serde_json::to_string(other).unwrap_or_else(|_| "{}".to_string()),
            max_len,
        ),
    }
}

fn truncate_str(value: &str, max_len: usize) -> String {
    if max_len <= 3 || value.len() <= max_len {
        return value.to_string();
    }
    let mut cut = max_len - 3;
    while !value.is_char_boundary(cut) {
        cut -= 1;
    }
    format!("{}...", &value[..cut])
}

fn format_events(events: &[Event]) -> String {
    events
        .iter()
        .map(|e| {
            format!(
                "- id={} [{}] {} | {} | {} | {}",
                e.id,
                time_fmt(e.timestamp),
                e.severity,
                e.source,
                e.kind,
                truncate(
                    &serde_json::Value::Object(e.payload.clone()),
                    PAYLOAD_MAX_LEN
                ),
            )
        })
        .collect::<Vec<_>>()
        .join("\n")
}

fn format_summaries(summaries: &[EventSummary]) -> String {
    summaries
        .iter()
        .map(|s| {
            format!(
                "- bucket_id={} (until {}) total={} by_severity={} by_type={}",
                time_fmt(s.bucket_start),
                time_fmt(s.bucket_end),
                s.total_count,
                truncate(
                    &serde_json::to_value(&s.by_severity).unwrap_or_default(),
                    PAYLOAD_MAX_LEN
                ),
                truncate(
                    &serde_json::to_value(&s.by_type).unwrap_or_default(),
                    PAYLOAD_MAX_LEN
                ),
            )
        })
        .collect::<Vec<_>>()
        .join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Severity;
    use chrono::{TimeZone, Utc};

    fn event(i: usize) -> Event {
        Event {
            id: format!("{i:032x}"),
            timestamp: Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, i as u32).unwrap(),
            source: "firewall".to_string(),
            severity: Severity::Warn,
            kind: "connection_blocked".to_string(),
            payload: serde_json::Map::new(),
        }
    }

    #[test]
    fn library_loads_embedded_templates() {
        let lib = PromptLibrary::load().unwrap();
        assert!(!lib.analyze.config.model.is_empty());
        assert!(!lib.tier1.config.model.is_empty());
        assert!(!lib.tier2.config.model.is_empty());
    }

    #[test]
    fn analyze_render_substitutes_question_and_events() {
        let lib = PromptLibrary::load().unwrap();
        let events: Vec<Event> = (0..3).map(event).collect();
        let pair = lib.render_analyze("what happened?", &events);

        assert!(pair.user.contains("what happened?"));
        assert!(pair.user.contains("connection_blocked"));
        assert!(!pair.user.contains("{{"));
        assert!(!pair.system.is_empty());
    }

    #[test]
    fn analyze_render_caps_events_and_reports_overflow() {
        let lib = PromptLibrary::load().unwrap();
        let events: Vec<Event> = (0..PROMPT_EVENTS_LIMIT + 7).map(event).collect();
        let pair = lib.render_analyze("q", &events);

        assert!(pair.user.contains("7 additional events"));
        assert_eq!(pair.user.matches("- id=").count(), PROMPT_EVENTS_LIMIT);
    }

    #[test]
    fn frontmatter_requires_model() {
        let raw = "---\nversion: \"1\"\n---\n<!-- user -->\nhello\n";
        let err = PromptTemplate::parse("t", raw).unwrap_err();
        assert!(err.to_string().contains("missing model"));
    }

    #[test]
    fn missing_frontmatter_is_fatal() {
        assert!(PromptTemplate::parse("t", "<!-- user -->\nhello\n").is_err());
    }

    #[test]
    fn time_fmt_is_rfc3339_zulu() {
        let ts = Utc.with_ymd_and_hms(2026, 1, 1, 0, 5, 0).unwrap();
        assert_eq!(time_fmt(ts), "2026-01-01T00:05:00Z");
    }

    #[test]
    fn truncate_handles_value_shapes() {
        assert_eq!(truncate(&serde_json::Value::Null, 10), "{}");
        assert_eq!(truncate(&serde_json::json!({}), 10), "{}");
        assert_eq!(truncate(&serde_json::json!("short"), 10), "short");

        let long = truncate(&serde_json::json!("a".repeat(50)), 10);
        assert_eq!(long.len(), 10);
        assert!(long.ends_with("..."));

        let obj = truncate(&serde_json::json!({"ip": "10.0.0.1"}), 200);
        assert!(obj.contains("10.0.0.1"));
    }
}
