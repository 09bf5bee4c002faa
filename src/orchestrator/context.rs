use std::collections::BTreeMap;

use super::Topic;
use crate::checkpoint::truncate_chars;
use crate::storage::AnalysisResultSnapshot;

/// Characters of a dependency summary carried into the digest.
pub const DIGEST_SUMMARY_CHARS: usize = 600;

/// Digest of the finalized results a topic depends on.
///
/// Dependencies without a result are left out.
pub fn build_context_digest(
    topic: &Topic,
    results: &BTreeMap<String, AnalysisResultSnapshot>,
) -> String {
    let mut digest = String::from("Context from prior analyses:\n");
    for dep in &topic.depends_on {
        let Some(result) = results.get(dep) else {
            continue;
        };
        digest.push_str(&format!(
            "- [{}] {}\n  Verdict: {} (winning hypothesis {}, posterior {:.3})\n  Summary: {}\n",
            dep,
            result.proposition,
            result.verdict,
            result.winning_hypothesis,
            result.posterior,
            truncate_chars(&result.summary, DIGEST_SUMMARY_CHARS),
        ));
    }
    digest
}

/// Proposition handed to the topic's session.
pub fn contextualize_proposition(
    topic: &Topic,
    results: &BTreeMap<String, AnalysisResultSnapshot>,
) -> String {
    if !topic.context_from_prior || topic.depends_on.is_empty() {
        return topic.proposition.clone();
    }
    format!(
        "{}\nProposition: {}",
        build_context_digest(topic, results),
        topic.proposition
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn result(proposition: &str, verdict: &str, summary: &str) -> AnalysisResultSnapshot {
        AnalysisResultSnapshot {
            analysis_id: "a".to_string(),
            proposition: proposition.to_string(),
            verdict: verdict.to_string(),
            winning_hypothesis: "H1".to_string(),
            posterior: 0.8,
            summary: summary.to_string(),
            paradigms: Vec::new(),
            total_cost_usd: 0.0,
            completed_at: Utc::now(),
        }
    }

    #[test]
    fn test_digest_lists_each_dependency() {
        let topic = Topic::new("C", "C holds")
            .with_dependency("A")
            .with_dependency("B")
            .with_context_from_prior();
        let mut results = BTreeMap::new();
        results.insert("A".to_string(), result("A holds", "supported", "A summary"));
        results.insert("B".to_string(), result("B holds", "refuted", "B summary"));

        let text = contextualize_proposition(&topic, &results);
        assert!(text.contains("[A] A holds"));
        assert!(text.contains("Verdict: supported (winning hypothesis H1, posterior 0.800)"));
        assert!(text.contains("[B] B holds"));
        assert!(text.contains("Verdict: refuted"));
        assert!(text.ends_with("Proposition: C holds"));
    }

    #[test]
    fn test_summary_is_clipped() {
        let topic = Topic::new("B", "B holds")
            .with_dependency("A")
            .with_context_from_prior();
        let mut results = BTreeMap::new();
        results.insert("A".to_string(), result("A", "supported", &"s".repeat(2000)));

        let digest = build_context_digest(&topic, &results);
        assert!(digest.contains(&"s".repeat(DIGEST_SUMMARY_CHARS)));
        assert!(!digest.contains(&"s".repeat(DIGEST_SUMMARY_CHARS + 1)));
    }

    #[test]
    fn test_without_flag_proposition_is_unchanged() {
        let topic = Topic::new("B", "B holds").with_dependency("A");
        let mut results = BTreeMap::new();
        results.insert("A".to_string(), result("A", "supported", "x"));

        assert_eq!(contextualize_proposition(&topic, &results), "B holds");
    }
}
