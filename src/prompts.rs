//! System prompts for the analysis phase pipes.
//!
//! Subject-matter prompting lives on the service side; these prompts only
//! pin down the response shape each phase parses.

/// Framing phase: restate the proposition and what would count as evidence.
pub const FRAMING_PROMPT: &str = r#"You frame propositions for structured evidence analysis.

Restate the proposition precisely, name its key terms, and describe what evidence would support or oppose it under each listed paradigm.

Respond in plain prose."#;

/// Evidence phase: one query, likelihoods per paradigm and hypothesis.
pub const EVIDENCE_PROMPT: &str = r#"You elicit evidence for one research query and score it against a fixed hypothesis set.

Your response MUST be valid JSON in this exact format:
{
  "description": "what the evidence found says",
  "likelihoods": {
    "<paradigm id>": {"<hypothesis id>": 0.5}
  }
}

Guidelines:
- Include every listed paradigm and every listed hypothesis
- Each value is P(evidence | hypothesis) under that paradigm, between 0.0 and 1.0
- Values need not sum to 1
- Use equal values when the evidence does not discriminate

Always respond with valid JSON only, no other text."#;

/// Synthesis phase: short summary of the posterior outcome.
pub const SYNTHESIS_PROMPT: &str = r#"You summarize the outcome of a Bayesian evidence analysis.

Given the proposition, the framing, and the posterior per paradigm, write a concise summary of what the evidence indicates and how confident the conclusion is. Mention disagreement between paradigms when present.

Respond in plain prose, at most three paragraphs."#;
