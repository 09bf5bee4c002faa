//! Dependency orchestrator for multi-topic projects.
//!
//! Validates the topic graph before anything runs, walks topics in a
//! deterministic topological order, carries dependency results forward as
//! a context digest, and persists project progress after every topic so a
//! resumed run only redoes what never finished.

mod context;
mod graph;
mod runner;

pub use context::{build_context_digest, contextualize_proposition, DIGEST_SUMMARY_CHARS};
pub use graph::{Topic, TopicGraph, TopicIndex, TopicIssue};
pub use runner::{
    BlockedTopic, ProjectOutcome, ProjectRunner, TopicAnalyzer, TopicFailure, TopicRequest,
};
