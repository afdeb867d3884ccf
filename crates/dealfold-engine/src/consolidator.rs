//! Composite assembly: one authoritative view per correlated deal, with
//! explicit conflict reporting against the raw member values.

use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};

use dealfold_core::{OpportunityRecord, Priority, Stage};
use serde::{Deserialize, Serialize};

use crate::correlator::{OpportunityCluster, OpportunityCorrelator};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ConsolidatorConfig {
    /// Forwarded to the correlator as its cluster threshold.
    pub min_score: f64,
}

impl Default for ConsolidatorConfig {
    fn default() -> Self {
        Self { min_score: 0.4 }
    }
}

/// Disjoint raw values per field. A field is listed only when the
/// members disagree; consumers get both the voted "best guess" and the
/// signal that the guess is contested.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConflictReport {
    pub stages: Vec<Stage>,
    pub priorities: Vec<Priority>,
    pub vendors: Vec<String>,
    pub customers: Vec<String>,
    pub has_mixed_sources: bool,
}

impl ConflictReport {
    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
            && self.priorities.is_empty()
            && self.vendors.is_empty()
            && self.customers.is_empty()
            && !self.has_mixed_sources
    }
}

/// Durable, client-facing unit: either a merged cluster or a
/// `single-<id>` wrapper around one unclustered record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompositeOpportunity {
    pub composite_id: String,
    pub name: String,
    pub stage: Stage,
    pub stage_confidence: f64,
    pub priority: Priority,
    pub priority_confidence: f64,
    pub vendors: Vec<String>,
    pub customers: Vec<String>,
    pub actors: Vec<String>,
    pub tags: Vec<String>,
    pub score: f64,
    pub member_ids: Vec<String>,
    pub conflicts: ConflictReport,
}

#[derive(Debug, Clone)]
pub struct OpportunityConsolidator {
    correlator: OpportunityCorrelator,
}

impl Default for OpportunityConsolidator {
    fn default() -> Self {
        Self::new(ConsolidatorConfig::default())
    }
}

impl OpportunityConsolidator {
    pub fn new(config: ConsolidatorConfig) -> Self {
        Self {
            correlator: OpportunityCorrelator::with_min_score(config.min_score),
        }
    }

    /// The underlying clustering pass, for callers that persist clusters
    /// alongside composites.
    pub fn correlate(&self, records: &[OpportunityRecord]) -> Vec<OpportunityCluster> {
        self.correlator.correlate(records)
    }

    pub fn consolidate(&self, records: &[OpportunityRecord]) -> Vec<CompositeOpportunity> {
        let clusters = self.correlator.correlate(records);
        let by_id: HashMap<&str, &OpportunityRecord> =
            records.iter().map(|r| (r.id.as_str(), r)).collect();

        let mut claimed: HashSet<&str> = HashSet::new();
        let mut composites = Vec::new();
        for cluster in &clusters {
            let members: Vec<&OpportunityRecord> = cluster
                .member_ids
                .iter()
                .filter_map(|id| by_id.get(id.as_str()).copied())
                .collect();
            for id in &cluster.member_ids {
                claimed.insert(id.as_str());
            }
            composites.push(composite_from_cluster(cluster, &members));
        }

        for record in records {
            if !claimed.contains(record.id.as_str()) {
                composites.push(singleton(record));
            }
        }

        // Stable: clustered composites keep their lead over singletons on
        // score ties.
        composites.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(Ordering::Equal));
        composites
    }
}

fn composite_from_cluster(
    cluster: &OpportunityCluster,
    members: &[&OpportunityRecord],
) -> CompositeOpportunity {
    CompositeOpportunity {
        composite_id: cluster.cluster_id.clone(),
        name: vote_name(members),
        stage: cluster.summary.stage,
        stage_confidence: cluster.summary.stage_confidence,
        priority: cluster.summary.priority,
        priority_confidence: cluster.summary.priority_confidence,
        vendors: cluster.summary.vendors.clone(),
        customers: cluster.summary.customers.clone(),
        actors: cluster.summary.actors.clone(),
        tags: cluster.summary.tags.clone(),
        score: cluster.score,
        member_ids: cluster.member_ids.clone(),
        conflicts: conflicts_for(members),
    }
}

/// Conflicts compare the raw per-record values, not the voted summary.
fn conflicts_for(members: &[&OpportunityRecord]) -> ConflictReport {
    let mut stages: Vec<Stage> = Vec::new();
    let mut priorities: Vec<Priority> = Vec::new();
    let mut vendors: Vec<String> = Vec::new();
    let mut customers: Vec<String> = Vec::new();
    let mut connectors: Vec<String> = Vec::new();

    for member in members {
        if !stages.contains(&member.stage) {
            stages.push(member.stage);
        }
        if !priorities.contains(&member.priority) {
            priorities.push(member.priority);
        }
        if let Some(vendor) = member.vendor() {
            if !vendors.iter().any(|v| v == vendor) {
                vendors.push(vendor.to_string());
            }
        }
        if let Some(customer) = member.customer() {
            if !customers.iter().any(|c| c == customer) {
                customers.push(customer.to_string());
            }
        }
        for source in &member.source_summary {
            if let Some(connector) = source
                .connector
                .as_deref()
                .map(str::trim)
                .filter(|c| !c.is_empty())
            {
                if !connectors.iter().any(|c| c == connector) {
                    connectors.push(connector.to_string());
                }
            }
        }
    }

    ConflictReport {
        stages: keep_if_disputed(stages),
        priorities: keep_if_disputed(priorities),
        vendors: keep_if_disputed(vendors),
        customers: keep_if_disputed(customers),
        has_mixed_sources: connectors.len() > 1,
    }
}

fn keep_if_disputed<T>(distinct: Vec<T>) -> Vec<T> {
    if distinct.len() > 1 {
        distinct
    } else {
        Vec::new()
    }
}

/// Most frequent non-empty member name; ties go to the earliest member.
fn vote_name(members: &[&OpportunityRecord]) -> String {
    let mut counts: HashMap<&str, usize> = HashMap::new();
    for member in members {
        if !member.name.is_empty() {
            *counts.entry(member.name.as_str()).or_default() += 1;
        }
    }
    let best = counts.values().copied().max().unwrap_or(0);
    members
        .iter()
        .find(|m| counts.get(m.name.as_str()).copied() == Some(best))
        .map(|m| m.name.clone())
        .unwrap_or_default()
}

fn singleton(record: &OpportunityRecord) -> CompositeOpportunity {
    CompositeOpportunity {
        composite_id: format!("single-{}", record.id),
        name: record.name.clone(),
        stage: record.stage,
        stage_confidence: 1.0,
        priority: record.priority,
        priority_confidence: 1.0,
        vendors: record.vendor().map(str::to_string).into_iter().collect(),
        customers: record.customer().map(str::to_string).into_iter().collect(),
        actors: record.actors.clone(),
        tags: record.opportunity_tags(),
        score: 1.0,
        member_ids: vec![record.id.clone()],
        conflicts: ConflictReport::default(),
    }
}
