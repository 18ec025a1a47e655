//! Collective Intelligence Aggregator.
//!
//! Agents contribute scored data to topics. Contributions are aggregated
//! with one of several methods, mined for collaboration patterns, and
//! folded into a per-agent reputation.

pub mod aggregation;
pub mod contribution;
pub mod knowledge_base;
pub mod patterns;

pub use aggregation::{aggregate, AggregatedKnowledge, AggregationMethod, AggregationParams};
pub use contribution::{AgentContribution, Contribution};
pub use knowledge_base::CollectiveIntelligence;
pub use patterns::{detect_patterns, CollaborationPattern, PatternKind};
