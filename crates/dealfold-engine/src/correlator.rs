//! Scored clustering of records that describe the same underlying deal.

use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap};

use dealfold_core::{OpportunityRecord, Priority, Stage};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::debug;

// Tag overlap is the strongest deliberate signal (an explicit
// cross-reference), actor overlap corroborates, stage agreement is a
// weak tiebreaker.
const TAG_WEIGHT: f64 = 0.5;
const ACTOR_WEIGHT: f64 = 0.3;
const STAGE_WEIGHT: f64 = 0.2;
const ACTOR_SATURATION: f64 = 3.0;

const CLUSTER_ID_LEN: usize = 12;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CorrelatorConfig {
    /// Clusters scoring below this are discarded.
    pub min_score: f64,
}

impl Default for CorrelatorConfig {
    fn default() -> Self {
        Self { min_score: 0.3 }
    }
}

/// Signals shared by every member of a cluster.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ClusterSignals {
    pub shared_opportunity_tags: Vec<String>,
    pub shared_actors: Vec<String>,
}

/// Voted/aggregated view over a cluster's members.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClusterSummary {
    pub stage: Stage,
    pub stage_confidence: f64,
    pub priority: Priority,
    pub priority_confidence: f64,
    pub vendors: Vec<String>,
    pub customers: Vec<String>,
    pub actors: Vec<String>,
    pub tags: Vec<String>,
}

/// Transient grouping of two or more records sharing a correlation key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OpportunityCluster {
    pub cluster_id: String,
    pub key: String,
    pub member_ids: Vec<String>,
    pub score: f64,
    pub signals: ClusterSignals,
    pub summary: ClusterSummary,
}

/// Deterministic clustering over a batch of records. Pure and
/// synchronous: no I/O, never fails.
#[derive(Debug, Clone, Default)]
pub struct OpportunityCorrelator {
    config: CorrelatorConfig,
}

impl OpportunityCorrelator {
    pub fn new(config: CorrelatorConfig) -> Self {
        Self { config }
    }

    pub fn with_min_score(min_score: f64) -> Self {
        Self::new(CorrelatorConfig { min_score })
    }

    pub fn correlate(&self, records: &[OpportunityRecord]) -> Vec<OpportunityCluster> {
        let mut buckets: BTreeMap<String, Vec<&OpportunityRecord>> = BTreeMap::new();
        for record in records {
            for key in record.correlation_keys() {
                buckets.entry(key).or_default().push(record);
            }
        }

        let mut clusters = Vec::new();
        for (key, members) in &buckets {
            if members.len() < 2 {
                continue;
            }
            let signals = shared_signals(members);
            let (stage, stage_confidence) = vote_stage(members);
            let (priority, priority_confidence) = vote_priority(members);

            let tag_signal = if signals.shared_opportunity_tags.is_empty() {
                0.0
            } else {
                1.0
            };
            let actor_signal =
                (signals.shared_actors.len() as f64 / ACTOR_SATURATION).min(1.0);
            let score = TAG_WEIGHT * tag_signal
                + ACTOR_WEIGHT * actor_signal
                + STAGE_WEIGHT * stage_confidence;
            if score < self.config.min_score {
                continue;
            }

            let member_ids: Vec<String> = members.iter().map(|r| r.id.clone()).collect();
            clusters.push(OpportunityCluster {
                cluster_id: cluster_id(key, &member_ids),
                key: key.clone(),
                member_ids,
                score,
                signals,
                summary: ClusterSummary {
                    stage,
                    stage_confidence,
                    priority,
                    priority_confidence,
                    vendors: distinct_sorted(members.iter().filter_map(|r| r.vendor())),
                    customers: distinct_sorted(members.iter().filter_map(|r| r.customer())),
                    actors: union_actors(members),
                    tags: union_tags(members),
                },
            });
        }

        // Stable sort: ties keep deterministic bucket (key) order.
        clusters.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(Ordering::Equal));
        debug!(clusters = clusters.len(), "correlation pass complete");
        clusters
    }
}

/// First 12 hex chars of a content hash over the key and sorted member
/// ids, reproducible across runs for the same membership.
fn cluster_id(key: &str, member_ids: &[String]) -> String {
    let mut sorted = member_ids.to_vec();
    sorted.sort();
    let mut hasher = Sha256::new();
    hasher.update(key.as_bytes());
    for id in &sorted {
        hasher.update(b"|");
        hasher.update(id.as_bytes());
    }
    let mut digest = hex::encode(hasher.finalize());
    digest.truncate(CLUSTER_ID_LEN);
    digest
}

fn shared_signals(members: &[&OpportunityRecord]) -> ClusterSignals {
    let Some((first, rest)) = members.split_first() else {
        return ClusterSignals::default();
    };
    // Opportunity tags arrive lower-cased, so the intersection is
    // case-insensitive; actors keep their as-provided case.
    let mut shared_tags = first.opportunity_tags();
    let mut shared_actors = dedup_preserving(&first.actors);
    for member in rest {
        let tags = member.opportunity_tags();
        shared_tags.retain(|tag| tags.contains(tag));
        shared_actors.retain(|actor| member.actors.contains(actor));
    }
    ClusterSignals {
        shared_opportunity_tags: shared_tags,
        shared_actors,
    }
}

fn vote_stage(members: &[&OpportunityRecord]) -> (Stage, f64) {
    let mut counts: HashMap<Stage, usize> = HashMap::new();
    for member in members {
        *counts.entry(member.stage).or_default() += 1;
    }
    let winner = counts
        .iter()
        .max_by_key(|(stage, count)| (**count, stage.vote_precedence()));
    match winner {
        Some((stage, count)) => (*stage, *count as f64 / members.len() as f64),
        None => (Stage::Unknown, 0.0),
    }
}

fn vote_priority(members: &[&OpportunityRecord]) -> (Priority, f64) {
    let mut counts: HashMap<Priority, usize> = HashMap::new();
    for member in members {
        *counts.entry(member.priority).or_default() += 1;
    }
    let winner = counts
        .iter()
        .max_by_key(|(priority, count)| (**count, priority.vote_precedence()));
    match winner {
        Some((priority, count)) => (*priority, *count as f64 / members.len() as f64),
        None => (Priority::Medium, 0.0),
    }
}

fn distinct_sorted<'a>(values: impl Iterator<Item = &'a str>) -> Vec<String> {
    let mut out: Vec<String> = values.map(str::to_string).collect();
    out.sort();
    out.dedup();
    out
}

fn union_actors(members: &[&OpportunityRecord]) -> Vec<String> {
    let mut out = Vec::new();
    for member in members {
        for actor in &member.actors {
            if !out.contains(actor) {
                out.push(actor.clone());
            }
        }
    }
    out
}

fn union_tags(members: &[&OpportunityRecord]) -> Vec<String> {
    let mut out: Vec<String> = members
        .iter()
        .flat_map(|member| member.opportunity_tags())
        .collect();
    out.sort();
    out.dedup();
    out
}

fn dedup_preserving(values: &[String]) -> Vec<String> {
    let mut out = Vec::new();
    for value in values {
        if !out.contains(value) {
            out.push(value.clone());
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use dealfold_core::RecordMetadata;

    fn tagged(id: &str, tag: &str) -> OpportunityRecord {
        OpportunityRecord {
            id: id.into(),
            name: format!("record {id}"),
            source_tags: vec![format!("opportunity:{tag}")],
            ..Default::default()
        }
    }

    #[test]
    fn shared_tag_forms_one_cluster_with_both_members() {
        let records = vec![tagged("opp-1", "clearled-pdu"), tagged("opp-2", "clearled-pdu")];
        let clusters = OpportunityCorrelator::default().correlate(&records);

        assert_eq!(clusters.len(), 1);
        let cluster = clusters.first().expect("cluster");
        assert_eq!(cluster.member_ids, vec!["opp-1".to_string(), "opp-2".to_string()]);
        assert_eq!(
            cluster.signals.shared_opportunity_tags,
            vec!["clearled-pdu".to_string()]
        );
        // 0.5 tag signal + 0.2 full stage agreement
        assert!((cluster.score - 0.7).abs() < 1e-9);
    }

    #[test]
    fn untagged_records_fall_back_to_vendor_customer_stage() {
        let mut a = OpportunityRecord {
            id: "opp-1".into(),
            stage: Stage::Quote,
            ..Default::default()
        };
        a.metadata.vendor = Some("ClearLED".into());
        a.metadata.customer = Some("Northwind".into());
        a.actors = vec!["Dana Voss".into()];
        let mut b = a.clone();
        b.id = "opp-2".into();

        let clusters = OpportunityCorrelator::with_min_score(0.3).correlate(&[a, b]);
        assert_eq!(clusters.len(), 1);
        let cluster = clusters.first().expect("cluster");
        assert_eq!(cluster.key, "clearled|northwind|quote");
        assert!(cluster.signals.shared_opportunity_tags.is_empty());
        assert_eq!(cluster.signals.shared_actors, vec!["Dana Voss".to_string()]);
        // 0.3 * 1/3 actor signal + 0.2 stage agreement
        assert!((cluster.score - 0.3).abs() < 1e-9);
    }

    #[test]
    fn clusters_below_min_score_are_dropped() {
        let mut a = OpportunityRecord {
            id: "opp-1".into(),
            stage: Stage::Quote,
            ..Default::default()
        };
        a.metadata.vendor = Some("ClearLED".into());
        let mut b = a.clone();
        b.id = "opp-2".into();

        // Fallback key matches, but no tags and no actors: score 0.2.
        let clusters = OpportunityCorrelator::with_min_score(0.4).correlate(&[a.clone(), b.clone()]);
        assert!(clusters.is_empty());

        let clusters = OpportunityCorrelator::with_min_score(0.2).correlate(&[a, b]);
        assert_eq!(clusters.len(), 1);
    }

    #[test]
    fn singleton_buckets_are_discarded() {
        let records = vec![tagged("opp-1", "alpha"), tagged("opp-2", "beta")];
        let clusters = OpportunityCorrelator::default().correlate(&records);
        assert!(clusters.is_empty());
    }

    #[test]
    fn stage_vote_breaks_ties_by_precedence() {
        let mut a = tagged("opp-1", "deal");
        a.stage = Stage::Rfq;
        let mut b = tagged("opp-2", "deal");
        b.stage = Stage::Quote;
        let clusters = OpportunityCorrelator::default().correlate(&[a, b]);

        let summary = &clusters.first().expect("cluster").summary;
        assert_eq!(summary.stage, Stage::Quote);
        assert!((summary.stage_confidence - 0.5).abs() < 1e-9);
    }

    #[test]
    fn priority_vote_breaks_ties_high_over_low() {
        let mut a = tagged("opp-1", "deal");
        a.priority = Priority::Low;
        let mut b = tagged("opp-2", "deal");
        b.priority = Priority::High;
        let clusters = OpportunityCorrelator::default().correlate(&[a, b]);

        let summary = &clusters.first().expect("cluster").summary;
        assert_eq!(summary.priority, Priority::High);
        assert!((summary.priority_confidence - 0.5).abs() < 1e-9);
    }

    #[test]
    fn majority_beats_precedence() {
        let mut members: Vec<OpportunityRecord> = (0..3)
            .map(|i| {
                let mut r = tagged(&format!("opp-{i}"), "deal");
                r.stage = Stage::Research;
                r
            })
            .collect();
        if let Some(last) = members.last_mut() {
            last.stage = Stage::PoInProgress;
        }
        let clusters = OpportunityCorrelator::default().correlate(&members);
        let summary = &clusters.first().expect("cluster").summary;
        assert_eq!(summary.stage, Stage::Research);
        assert!((summary.stage_confidence - 2.0 / 3.0).abs() < 1e-9);
    }

    #[test]
    fn correlate_is_deterministic_across_runs() {
        let mut a = tagged("opp-1", "deal");
        a.actors = vec!["Dana".into(), "Lee".into()];
        let mut b = tagged("opp-2", "deal");
        b.actors = vec!["Lee".into()];
        let c = tagged("opp-3", "other-deal");
        let d = tagged("opp-4", "other-deal");
        let records = vec![a, b, c, d];

        let correlator = OpportunityCorrelator::default();
        let first = correlator.correlate(&records);
        let second = correlator.correlate(&records);
        assert_eq!(first, second);
        assert_eq!(first.len(), 2);
        for cluster in &first {
            assert_eq!(cluster.cluster_id.len(), 12);
            assert!(cluster.member_ids.len() >= 2);
        }
    }

    #[test]
    fn cluster_id_ignores_member_order() {
        let forward = cluster_id("deal", &["a".to_string(), "b".to_string()]);
        let reverse = cluster_id("deal", &["b".to_string(), "a".to_string()]);
        assert_eq!(forward, reverse);
        assert_ne!(forward, cluster_id("other", &["a".to_string(), "b".to_string()]));
    }

    #[test]
    fn record_can_join_clusters_under_multiple_tags() {
        let mut a = tagged("opp-1", "alpha");
        a.source_tags.push("opportunity:beta".into());
        let b = tagged("opp-2", "alpha");
        let c = tagged("opp-3", "beta");
        let clusters = OpportunityCorrelator::default().correlate(&[a, b, c]);

        let keys: Vec<&str> = clusters.iter().map(|c| c.key.as_str()).collect();
        assert!(keys.contains(&"alpha"));
        assert!(keys.contains(&"beta"));
        let alpha = clusters.iter().find(|c| c.key == "alpha").expect("alpha");
        assert!(alpha.member_ids.contains(&"opp-1".to_string()));
        let beta = clusters.iter().find(|c| c.key == "beta").expect("beta");
        assert!(beta.member_ids.contains(&"opp-1".to_string()));
    }

    #[test]
    fn summary_aggregates_vendors_and_actors() {
        let mut a = tagged("opp-1", "deal");
        a.metadata = RecordMetadata {
            vendor: Some("ClearLED".into()),
            customer: Some("Northwind".into()),
            ..Default::default()
        };
        a.actors = vec!["Dana".into()];
        let mut b = tagged("opp-2", "deal");
        b.metadata.vendor = Some("Acme".into());
        b.actors = vec!["Lee".into(), "Dana".into()];

        let clusters = OpportunityCorrelator::default().correlate(&[a, b]);
        let summary = &clusters.first().expect("cluster").summary;
        assert_eq!(summary.vendors, vec!["Acme".to_string(), "ClearLED".to_string()]);
        assert_eq!(summary.customers, vec!["Northwind".to_string()]);
        assert_eq!(summary.actors, vec!["Dana".to_string(), "Lee".to_string()]);
        assert_eq!(summary.tags, vec!["deal".to_string()]);
    }
}
