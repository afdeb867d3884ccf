//! Core domain model for sales-opportunity evidence records.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub const CRATE_NAME: &str = "dealfold-core";

/// Tag prefix that marks an explicit cross-document grouping key.
pub const OPPORTUNITY_TAG_PREFIX: &str = "opportunity:";

/// Deal stage extracted from source evidence.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Rfq,
    Quote,
    PoInProgress,
    Integration,
    Research,
    #[default]
    Unknown,
}

impl Stage {
    pub fn as_str(self) -> &'static str {
        match self {
            Stage::Rfq => "rfq",
            Stage::Quote => "quote",
            Stage::PoInProgress => "po_in_progress",
            Stage::Integration => "integration",
            Stage::Research => "research",
            Stage::Unknown => "unknown",
        }
    }

    /// Fixed order used to break majority-vote ties: later-stage wins.
    pub fn vote_precedence(self) -> u8 {
        match self {
            Stage::PoInProgress => 5,
            Stage::Quote => 4,
            Stage::Rfq => 3,
            Stage::Integration => 2,
            Stage::Research => 1,
            Stage::Unknown => 0,
        }
    }

    /// Lenient parse; anything unrecognized maps to `Unknown`.
    pub fn parse(value: &str) -> Self {
        match value.trim().to_ascii_lowercase().as_str() {
            "rfq" => Stage::Rfq,
            "quote" => Stage::Quote,
            "po_in_progress" => Stage::PoInProgress,
            "integration" => Stage::Integration,
            "research" => Stage::Research,
            _ => Stage::Unknown,
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Deal priority.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    High,
    #[default]
    Medium,
    Low,
}

impl Priority {
    pub fn as_str(self) -> &'static str {
        match self {
            Priority::High => "high",
            Priority::Medium => "medium",
            Priority::Low => "low",
        }
    }

    pub fn vote_precedence(self) -> u8 {
        match self {
            Priority::High => 2,
            Priority::Medium => 1,
            Priority::Low => 0,
        }
    }

    pub fn parse(value: &str) -> Self {
        match value.trim().to_ascii_lowercase().as_str() {
            "high" => Priority::High,
            "low" => Priority::Low,
            _ => Priority::Medium,
        }
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One source document reference backing a record.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceRef {
    #[serde(default)]
    pub parser: String,
    #[serde(default)]
    pub file_name: String,
    #[serde(default)]
    pub source_type: String,
    #[serde(default)]
    pub connector: Option<String>,
    #[serde(default)]
    pub query: Option<String>,
}

/// Structured next-step plan (owner/due-date), when the mapper extracted one.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NextStepPlan {
    #[serde(default)]
    pub owner: Option<String>,
    #[serde(default)]
    pub due_date: Option<String>,
}

/// Optional human-review annotation carried in record metadata.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReviewAnnotation {
    #[serde(default)]
    pub reviewed_by: Option<String>,
    #[serde(default)]
    pub reviewed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub note: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RecordMetadata {
    #[serde(default)]
    pub vendor: Option<String>,
    #[serde(default)]
    pub customer: Option<String>,
    #[serde(default)]
    pub parser: Option<String>,
    #[serde(default)]
    pub confidence: Option<f64>,
    #[serde(default)]
    pub last_touched: Option<DateTime<Utc>>,
    #[serde(default)]
    pub review: Option<ReviewAnnotation>,
}

/// One candidate opportunity extracted from one source document.
///
/// `id` is externally generated, immutable, and unique within a store.
/// `created_at`/`updated_at` are repository-assigned; `created_at` never
/// changes once set.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OpportunityRecord {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub stage: Stage,
    #[serde(default)]
    pub priority: Priority,
    #[serde(default)]
    pub actors: Vec<String>,
    #[serde(default)]
    pub next_steps: Option<String>,
    #[serde(default)]
    pub structured_next_steps: Option<NextStepPlan>,
    #[serde(default)]
    pub source_tags: Vec<String>,
    #[serde(default)]
    pub source_summary: Vec<SourceRef>,
    #[serde(default)]
    pub metadata: RecordMetadata,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
}

impl OpportunityRecord {
    /// Non-empty vendor from metadata, if any.
    pub fn vendor(&self) -> Option<&str> {
        self.metadata
            .vendor
            .as_deref()
            .map(str::trim)
            .filter(|v| !v.is_empty())
    }

    /// Non-empty customer from metadata, if any.
    pub fn customer(&self) -> Option<&str> {
        self.metadata
            .customer
            .as_deref()
            .map(str::trim)
            .filter(|c| !c.is_empty())
    }

    /// `opportunity:`-prefixed tags with the prefix stripped and lower-cased.
    pub fn opportunity_tags(&self) -> Vec<String> {
        let mut tags: Vec<String> = self
            .source_tags
            .iter()
            .filter_map(|tag| {
                let lowered = tag.trim().to_ascii_lowercase();
                lowered
                    .strip_prefix(OPPORTUNITY_TAG_PREFIX)
                    .map(|rest| rest.trim().to_string())
            })
            .filter(|tag| !tag.is_empty())
            .collect();
        tags.sort();
        tags.dedup();
        tags
    }

    /// Grouping key used when no explicit `opportunity:` tag exists.
    pub fn fallback_key(&self) -> String {
        format!(
            "{}|{}|{}",
            self.vendor().unwrap_or_default().to_ascii_lowercase(),
            self.customer().unwrap_or_default().to_ascii_lowercase(),
            self.stage
        )
    }

    /// Candidate correlation keys: every opportunity tag, or the fallback
    /// vendor/customer/stage tuple when no tag exists.
    pub fn correlation_keys(&self) -> Vec<String> {
        let tags = self.opportunity_tags();
        if tags.is_empty() {
            vec![self.fallback_key()]
        } else {
            tags
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record_with_tags(tags: &[&str]) -> OpportunityRecord {
        OpportunityRecord {
            id: "opp-1".into(),
            source_tags: tags.iter().map(ToString::to_string).collect(),
            ..Default::default()
        }
    }

    #[test]
    fn stage_round_trips_through_serde_names() {
        for stage in [
            Stage::Rfq,
            Stage::Quote,
            Stage::PoInProgress,
            Stage::Integration,
            Stage::Research,
            Stage::Unknown,
        ] {
            let json = serde_json::to_string(&stage).expect("serialize stage");
            assert_eq!(json, format!("\"{}\"", stage.as_str()));
            assert_eq!(Stage::parse(stage.as_str()), stage);
        }
    }

    #[test]
    fn stage_parse_defaults_to_unknown() {
        assert_eq!(Stage::parse("negotiation"), Stage::Unknown);
        assert_eq!(Stage::parse(""), Stage::Unknown);
    }

    #[test]
    fn vote_precedence_orders_late_stages_first() {
        assert!(Stage::PoInProgress.vote_precedence() > Stage::Quote.vote_precedence());
        assert!(Stage::Quote.vote_precedence() > Stage::Rfq.vote_precedence());
        assert!(Stage::Rfq.vote_precedence() > Stage::Integration.vote_precedence());
        assert!(Stage::Integration.vote_precedence() > Stage::Research.vote_precedence());
        assert!(Stage::Research.vote_precedence() > Stage::Unknown.vote_precedence());
        assert!(Priority::High.vote_precedence() > Priority::Medium.vote_precedence());
        assert!(Priority::Medium.vote_precedence() > Priority::Low.vote_precedence());
    }

    #[test]
    fn opportunity_tags_strip_prefix_and_lowercase() {
        let record = record_with_tags(&["opportunity:ClearLED-PDU", "status:open", "Opportunity:clearled-pdu"]);
        assert_eq!(record.opportunity_tags(), vec!["clearled-pdu".to_string()]);
    }

    #[test]
    fn fallback_key_is_empty_string_safe() {
        let record = OpportunityRecord {
            id: "opp-2".into(),
            ..Default::default()
        };
        assert_eq!(record.fallback_key(), "||unknown");
        assert_eq!(record.correlation_keys(), vec!["||unknown".to_string()]);
    }

    #[test]
    fn correlation_keys_prefer_tags_over_fallback() {
        let mut record = record_with_tags(&["opportunity:alpha", "opportunity:beta"]);
        record.metadata.vendor = Some("Acme".into());
        assert_eq!(
            record.correlation_keys(),
            vec!["alpha".to_string(), "beta".to_string()]
        );
    }
}
