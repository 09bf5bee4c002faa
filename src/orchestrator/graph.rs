//! Topic dependency graph: validation and execution order.
//!
//! Topics live in an arena indexed by declaration position; edges are kept
//! by index in both directions. Validation collects every problem before
//! failing, and cycle detection is an iterative depth-first search.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};

use crate::error::ConfigValidationError;

/// Index into the topic arena (declaration order).
pub type TopicIndex = usize;

/// One proposition to analyze, possibly depending on others.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Topic {
    pub id: String,
    pub proposition: String,
    #[serde(default)]
    pub depends_on: Vec<String>,
    /// Prepend a digest of dependency results to the proposition.
    #[serde(default)]
    pub context_from_prior: bool,
    /// Overrides the project-wide scenario config for this topic.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scenario_config: Option<serde_json::Value>,
}

impl Topic {
    pub fn new(id: impl Into<String>, proposition: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            proposition: proposition.into(),
            depends_on: Vec::new(),
            context_from_prior: false,
            scenario_config: None,
        }
    }

    pub fn with_dependency(mut self, id: impl Into<String>) -> Self {
        self.depends_on.push(id.into());
        self
    }

    pub fn with_context_from_prior(mut self) -> Self {
        self.context_from_prior = true;
        self
    }

    pub fn with_scenario_config(mut self, config: serde_json::Value) -> Self {
        self.scenario_config = Some(config);
        self
    }
}

/// A single problem found while validating a topic set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "issue", rename_all = "snake_case")]
pub enum TopicIssue {
    EmptyId { index: usize },
    EmptyProposition { topic: String },
    DuplicateId { id: String },
    UnknownDependency { topic: String, dependency: String },
    /// Full path following `depends_on`, first id repeated at the end.
    Cycle { path: Vec<String> },
}

impl std::fmt::Display for TopicIssue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TopicIssue::EmptyId { index } => {
                write!(f, "Topic at position {} has an empty id", index)
            }
            TopicIssue::EmptyProposition { topic } => {
                write!(f, "Topic '{}' has an empty proposition", topic)
            }
            TopicIssue::DuplicateId { id } => write!(f, "Duplicate topic id '{}'", id),
            TopicIssue::UnknownDependency { topic, dependency } => write!(
                f,
                "Topic '{}' depends on unknown topic '{}'",
                topic, dependency
            ),
            TopicIssue::Cycle { path } => write!(f, "Dependency cycle: {}", path.join(" -> ")),
        }
    }
}

/// Validated acyclic topic graph.
#[derive(Debug, Clone)]
pub struct TopicGraph {
    topics: Vec<Topic>,
    /// index -> topics that depend on it
    forward_edges: Vec<Vec<TopicIndex>>,
    /// index -> topics it depends on
    reverse_edges: Vec<Vec<TopicIndex>>,
}

impl TopicGraph {
    /// Validate topics and build the graph, reporting every issue at once.
    pub fn build(topics: Vec<Topic>) -> Result<Self, ConfigValidationError> {
        let mut issues = Vec::new();

        let mut index_map = HashMap::new();
        for (i, topic) in topics.iter().enumerate() {
            if topic.id.trim().is_empty() {
                issues.push(TopicIssue::EmptyId { index: i });
                continue;
            }
            if topic.proposition.trim().is_empty() {
                issues.push(TopicIssue::EmptyProposition {
                    topic: topic.id.clone(),
                });
            }
            if index_map.contains_key(&topic.id) {
                issues.push(TopicIssue::DuplicateId {
                    id: topic.id.clone(),
                });
            } else {
                index_map.insert(topic.id.clone(), i);
            }
        }

        let mut forward_edges: Vec<Vec<TopicIndex>> = vec![Vec::new(); topics.len()];
        let mut reverse_edges: Vec<Vec<TopicIndex>> = vec![Vec::new(); topics.len()];

        for (to_idx, topic) in topics.iter().enumerate() {
            // Duplicates after the first declaration do not get edges.
            if index_map.get(&topic.id) != Some(&to_idx) {
                continue;
            }
            for dep in &topic.depends_on {
                match index_map.get(dep) {
                    Some(&from_idx) => {
                        if !reverse_edges[to_idx].contains(&from_idx) {
                            forward_edges[from_idx].push(to_idx);
                            reverse_edges[to_idx].push(from_idx);
                        }
                    }
                    None => issues.push(TopicIssue::UnknownDependency {
                        topic: topic.id.clone(),
                        dependency: dep.clone(),
                    }),
                }
            }
        }

        let graph = Self {
            topics,
            forward_edges,
            reverse_edges,
        };

        issues.extend(
            graph
                .find_cycles()
                .into_iter()
                .map(|path| TopicIssue::Cycle { path }),
        );

        if issues.is_empty() {
            Ok(graph)
        } else {
            Err(ConfigValidationError { issues })
        }
    }

    pub fn len(&self) -> usize {
        self.topics.len()
    }

    pub fn is_empty(&self) -> bool {
        self.topics.is_empty()
    }

    pub fn topic(&self, index: TopicIndex) -> Option<&Topic> {
        self.topics.get(index)
    }

    pub fn topics(&self) -> &[Topic] {
        &self.topics
    }

    /// Topics that depend on the given topic.
    pub fn dependents(&self, index: TopicIndex) -> &[TopicIndex] {
        self.forward_edges.get(index).map_or(&[], |v| v.as_slice())
    }

    /// Topics the given topic depends on.
    pub fn dependencies(&self, index: TopicIndex) -> &[TopicIndex] {
        self.reverse_edges.get(index).map_or(&[], |v| v.as_slice())
    }

    /// Every cycle reachable by a depth-first walk along `depends_on`.
    fn find_cycles(&self) -> Vec<Vec<String>> {
        #[derive(Clone, Copy, PartialEq)]
        enum Mark {
            Unvisited,
            OnStack,
            Done,
        }

        let mut marks = vec![Mark::Unvisited; self.topics.len()];
        let mut cycles = Vec::new();

        for root in 0..self.topics.len() {
            if marks[root] != Mark::Unvisited {
                continue;
            }

            // (node, next dependency to visit)
            let mut stack: Vec<(TopicIndex, usize)> = vec![(root, 0)];
            marks[root] = Mark::OnStack;

            while let Some(frame) = stack.last_mut() {
                let (node, next) = *frame;
                match self.dependencies(node).get(next) {
                    Some(&dep) => {
                        frame.1 += 1;
                        match marks[dep] {
                            Mark::Unvisited => {
                                marks[dep] = Mark::OnStack;
                                stack.push((dep, 0));
                            }
                            Mark::OnStack => {
                                let start = stack
                                    .iter()
                                    .position(|&(n, _)| n == dep)
                                    .unwrap_or(0);
                                let mut path: Vec<String> = stack[start..]
                                    .iter()
                                    .map(|&(n, _)| self.topics[n].id.clone())
                                    .collect();
                                path.push(self.topics[dep].id.clone());
                                cycles.push(path);
                            }
                            Mark::Done => {}
                        }
                    }
                    None => {
                        marks[node] = Mark::Done;
                        stack.pop();
                    }
                }
            }
        }

        cycles
    }

    /// Topological order; among ready topics the lowest declaration index goes first.
    pub fn execution_order(&self) -> Vec<TopicIndex> {
        let mut in_degree: Vec<usize> = self.reverse_edges.iter().map(Vec::len).collect();
        let mut ready: BTreeSet<TopicIndex> = in_degree
            .iter()
            .enumerate()
            .filter(|&(_, deg)| *deg == 0)
            .map(|(i, _)| i)
            .collect();

        let mut order = Vec::with_capacity(self.topics.len());
        while let Some(node) = ready.pop_first() {
            order.push(node);
            for &dependent in self.dependents(node) {
                in_degree[dependent] -= 1;
                if in_degree[dependent] == 0 {
                    ready.insert(dependent);
                }
            }
        }

        order
    }

    /// Topic ids in execution order.
    pub fn execution_order_ids(&self) -> Vec<&str> {
        self.execution_order()
            .into_iter()
            .map(|i| self.topics[i].id.as_str())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_execution_order_respects_dependencies() {
        let graph = TopicGraph::build(vec![
            Topic::new("C", "c").with_dependency("A").with_dependency("B"),
            Topic::new("B", "b").with_dependency("A"),
            Topic::new("A", "a"),
        ])
        .unwrap();

        assert_eq!(graph.execution_order_ids(), vec!["A", "B", "C"]);
    }

    #[test]
    fn test_ready_ties_use_declaration_order() {
        let graph = TopicGraph::build(vec![
            Topic::new("Z", "z"),
            Topic::new("M", "m"),
            Topic::new("A", "a").with_dependency("Z"),
        ])
        .unwrap();

        assert_eq!(graph.execution_order_ids(), vec!["Z", "M", "A"]);
    }

    #[test]
    fn test_cycle_reports_full_path() {
        let err = TopicGraph::build(vec![
            Topic::new("A", "a").with_dependency("B"),
            Topic::new("B", "b").with_dependency("C"),
            Topic::new("C", "c").with_dependency("A"),
        ])
        .unwrap_err();

        assert_eq!(
            err.issues,
            vec![TopicIssue::Cycle {
                path: vec!["A".into(), "B".into(), "C".into(), "A".into()]
            }]
        );
        assert!(err.to_string().contains("A -> B -> C -> A"));
    }

    #[test]
    fn test_self_dependency_is_a_cycle() {
        let err = TopicGraph::build(vec![Topic::new("A", "a").with_dependency("A")]).unwrap_err();
        assert_eq!(
            err.issues,
            vec![TopicIssue::Cycle {
                path: vec!["A".into(), "A".into()]
            }]
        );
    }

    #[test]
    fn test_validation_collects_all_issues() {
        let err = TopicGraph::build(vec![
            Topic::new("A", "a"),
            Topic::new("A", "again"),
            Topic::new("B", "").with_dependency("Z"),
            Topic::new("", "no id"),
        ])
        .unwrap_err();

        assert_eq!(
            err.issues,
            vec![
                TopicIssue::DuplicateId { id: "A".into() },
                TopicIssue::EmptyProposition { topic: "B".into() },
                TopicIssue::EmptyId { index: 3 },
                TopicIssue::UnknownDependency {
                    topic: "B".into(),
                    dependency: "Z".into()
                },
            ]
        );
    }

    #[test]
    fn test_empty_graph_is_valid() {
        let graph = TopicGraph::build(Vec::new()).unwrap();
        assert!(graph.is_empty());
        assert!(graph.execution_order().is_empty());
    }
}
