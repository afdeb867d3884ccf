//! Correlation and consolidation of opportunity records into composite
//! opportunities. Pure, synchronous, deterministic.

mod consolidator;
mod correlator;

pub use consolidator::{
    CompositeOpportunity, ConflictReport, ConsolidatorConfig, OpportunityConsolidator,
};
pub use correlator::{
    ClusterSignals, ClusterSummary, CorrelatorConfig, OpportunityCluster, OpportunityCorrelator,
};

pub const CRATE_NAME: &str = "dealfold-engine";
