//! Token-budget relevance filter for oversized documents.
//!
//! Documents that fit the tier's token budget pass through untouched. When a
//! document is too large, it is split into paragraph units, each unit is
//! scored against contract-risk keyword categories, and the highest-scoring
//! units are kept greedily until the budget is spent. The first and last
//! units are always kept when they fit, since preambles and signature blocks
//! anchor the analysis. Kept units are reassembled in original document
//! order.

use once_cell::sync::Lazy;
use serde::Serialize;
use std::cmp::Reverse;
use std::collections::BTreeSet;
use tiktoken_rs::{cl100k_base, CoreBPE};

use crate::tiers::TierConfigSnapshot;
use crate::types::Tier;

static BPE: Lazy<CoreBPE> = Lazy::new(|| {
    // The embedded vocabulary always parses.
    cl100k_base().expect("cl100k_base vocabulary")
});

/// Keyword categories used for relevance scoring. A unit scores one point
/// per category it mentions, so breadth beats repetition.
const KEYWORD_CATEGORIES: &[(&str, &[&str])] = &[
    (
        "money",
        &[
            "payment", "price", "fee", "penalty", "compensation", "invoice", "deposit", "refund",
            "interest", "amount",
        ],
    ),
    (
        "duration",
        &[
            "term", "termination", "renewal", "expiration", "notice period", "duration",
            "effective date", "deadline",
        ],
    ),
    (
        "liability",
        &[
            "liability", "indemnif", "warranty", "guarantee", "damages", "negligence",
            "limitation of liability", "insurance",
        ],
    ),
    (
        "data",
        &[
            "personal data", "confidential", "privacy", "data protection", "gdpr",
            "intellectual property", "disclosure",
        ],
    ),
    (
        "dispute",
        &[
            "dispute", "arbitration", "jurisdiction", "governing law", "court", "mediation",
            "breach", "remedy",
        ],
    ),
];

/// Count tokens using the same vocabulary as the provider models.
pub fn count_tokens(text: &str) -> usize {
    BPE.encode_with_special_tokens(text).len()
}

/// Hard truncation to a token budget. Legacy path, used only when the
/// preprocessing feature flag is off.
pub fn truncate_to_tokens(text: &str, budget: usize) -> String {
    let tokens = BPE.encode_with_special_tokens(text);
    if tokens.len() <= budget {
        return text.to_string();
    }
    match BPE.decode(tokens[..budget].to_vec()) {
        Ok(decoded) => decoded,
        // A cut mid-codepoint can fail to decode; fall back to a char cut.
        Err(_) => text.chars().take(budget * 4).collect(),
    }
}

/// Outcome of the relevance filter, recorded alongside the analysis result.
#[derive(Debug, Clone, Serialize)]
pub struct PreprocessingResult {
    pub text: String,
    pub original_token_count: usize,
    pub processed_token_count: usize,
    pub was_reduced: bool,
    pub units_total: usize,
    pub units_kept: usize,
    /// Keyword categories observed across the kept units.
    pub categories: Vec<String>,
}

/// Split into paragraph units: runs of non-blank lines, trimmed.
fn split_paragraphs(text: &str) -> Vec<String> {
    let mut units = Vec::new();
    let mut current = String::new();
    for line in text.lines() {
        if line.trim().is_empty() {
            if !current.trim().is_empty() {
                units.push(current.trim().to_string());
            }
            current.clear();
        } else {
            if !current.is_empty() {
                current.push('\n');
            }
            current.push_str(line);
        }
    }
    if !current.trim().is_empty() {
        units.push(current.trim().to_string());
    }
    units
}

/// Categories a unit mentions, by lowercase substring match.
fn categories_of(unit: &str) -> Vec<&'static str> {
    let lower = unit.to_lowercase();
    KEYWORD_CATEGORIES
        .iter()
        .filter(|(_, keywords)| keywords.iter().any(|k| lower.contains(k)))
        .map(|(name, _)| *name)
        .collect()
}

/// Filter a document down to `budget` tokens, preferring risk-relevant
/// paragraphs. Identity for documents that already fit.
pub fn preprocess_document(text: &str, budget: usize) -> PreprocessingResult {
    let original_token_count = count_tokens(text);
    if original_token_count <= budget {
        return PreprocessingResult {
            text: text.to_string(),
            original_token_count,
            processed_token_count: original_token_count,
            was_reduced: false,
            units_total: 1,
            units_kept: 1,
            categories: categories_of(text).iter().map(|s| s.to_string()).collect(),
        };
    }

    let units = split_paragraphs(text);
    let counts: Vec<usize> = units.iter().map(|u| count_tokens(u)).collect();
    let scores: Vec<Vec<&'static str>> = units.iter().map(|u| categories_of(u)).collect();

    let mut kept: BTreeSet<usize> = BTreeSet::new();
    let mut used = 0usize;

    // Anchor the preamble and the closing block when they individually fit.
    if let Some(&first) = counts.first() {
        if first <= budget {
            kept.insert(0);
            used += first;
        }
    }
    if units.len() > 1 {
        let last = units.len() - 1;
        if used + counts[last] <= budget {
            kept.insert(last);
            used += counts[last];
        }
    }

    // Greedy by score, ties broken by document order.
    let mut order: Vec<usize> = (0..units.len()).collect();
    order.sort_by_key(|&i| (Reverse(scores[i].len()), i));
    for i in order {
        if kept.contains(&i) {
            continue;
        }
        if used + counts[i] <= budget {
            used += counts[i];
            kept.insert(i);
        }
    }

    let mut category_set: BTreeSet<&'static str> = BTreeSet::new();
    for &i in &kept {
        category_set.extend(scores[i].iter());
    }

    let assembled = kept
        .iter()
        .map(|&i| units[i].as_str())
        .collect::<Vec<_>>()
        .join("\n\n");
    let processed_token_count: usize = kept.iter().map(|&i| counts[i]).sum();

    tracing::debug!(
        original = original_token_count,
        processed = processed_token_count,
        units_total = units.len(),
        units_kept = kept.len(),
        "reduced document to token budget"
    );

    PreprocessingResult {
        text: assembled,
        original_token_count,
        processed_token_count,
        was_reduced: true,
        units_total: units.len(),
        units_kept: kept.len(),
        categories: category_set.iter().map(|s| s.to_string()).collect(),
    }
}

/// Per-tier token estimate for a document, used by the token check
/// endpoint before a caller commits credits.
#[derive(Debug, Clone, Serialize)]
pub struct TokenEstimate {
    pub token_count: usize,
    /// Tiers whose document budget the text fits without reduction.
    pub fits: Vec<String>,
    /// Tiers that would reduce the text.
    pub requires_reduction: Vec<String>,
}

pub fn estimate(text: &str, snapshot: &TierConfigSnapshot) -> TokenEstimate {
    let token_count = count_tokens(text);
    let mut fits = Vec::new();
    let mut requires_reduction = Vec::new();
    for tier in [Tier::Basic, Tier::Premium, Tier::Forensic] {
        let settings = snapshot.settings_for(tier);
        let budget = settings
            .token_limits
            .input
            .saturating_sub(tier.reserved_prompt_buffer());
        if token_count <= budget {
            fits.push(tier.as_str().to_string());
        } else {
            requires_reduction.push(tier.as_str().to_string());
        }
    }
    TokenEstimate {
        token_count,
        fits,
        requires_reduction,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn paragraph(topic: &str, filler_words: usize) -> String {
        let filler = vec!["lorem"; filler_words].join(" ");
        format!("{topic} {filler}")
    }

    #[test]
    fn small_documents_pass_through_unchanged() {
        let text = "Payment is due within thirty days.\n\nEither party may terminate.";
        let result = preprocess_document(text, 10_000);
        assert!(!result.was_reduced);
        assert_eq!(result.text, text);
        assert_eq!(result.original_token_count, result.processed_token_count);
    }

    #[test]
    fn reduction_prefers_risk_relevant_paragraphs() {
        let relevant = paragraph(
            "The penalty for late payment and the limitation of liability under arbitration",
            40,
        );
        let irrelevant = paragraph("The parties enjoyed a pleasant meeting about weather", 40);
        let text = format!(
            "{}\n\n{}\n\n{}\n\n{}",
            paragraph("Preamble between Acme and Widget Co", 10),
            irrelevant,
            relevant,
            paragraph("Signatures of both parties", 10),
        );

        let budget = count_tokens(&text) - count_tokens(&irrelevant) / 2;
        let result = preprocess_document(&text, budget);
        assert!(result.was_reduced);
        assert!(result.text.contains("penalty"));
        assert!(!result.text.contains("weather"));
        assert!(result.processed_token_count <= budget);
    }

    #[test]
    fn first_and_last_units_are_anchored() {
        let first = paragraph("Preamble with no keywords at all", 5);
        let last = paragraph("Closing signatures here", 5);
        let middle: Vec<String> = (0..20)
            .map(|i| paragraph(&format!("clause {i} about indemnification and damages"), 30))
            .collect();
        let text = format!("{first}\n\n{}\n\n{last}", middle.join("\n\n"));

        let budget = count_tokens(&text) / 3;
        let result = preprocess_document(&text, budget);
        assert!(result.text.starts_with(first.as_str()));
        assert!(result.text.ends_with(last.as_str()));
    }

    #[test]
    fn kept_units_stay_in_document_order() {
        let a = paragraph("arbitration clause", 5);
        let b = paragraph("payment terms", 5);
        let c = paragraph("liability cap", 5);
        let text = format!("{a}\n\n{b}\n\n{c}");
        let budget = count_tokens(&text);
        let result = preprocess_document(&text, budget - 1);
        let pos = |needle: &str| result.text.find(needle);
        if let (Some(pa), Some(pb)) = (pos("arbitration"), pos("payment")) {
            assert!(pa < pb);
        }
        if let (Some(pb), Some(pc)) = (pos("payment"), pos("liability cap")) {
            assert!(pb < pc);
        }
    }

    #[test]
    fn categories_cover_kept_units() {
        let text = "The penalty fee is due.\n\nDisputes go to arbitration.";
        let result = preprocess_document(text, 10_000);
        assert!(result.categories.contains(&"money".to_string()));
        assert!(result.categories.contains(&"dispute".to_string()));
    }

    #[test]
    fn truncate_respects_budget() {
        let text = vec!["token"; 500].join(" ");
        let out = truncate_to_tokens(&text, 100);
        assert!(count_tokens(&out) <= 100);
        assert!(text.starts_with(&out[..10]));
    }

    #[test]
    fn truncate_is_identity_under_budget() {
        let text = "short document";
        assert_eq!(truncate_to_tokens(text, 100), text);
    }

    #[test]
    fn estimate_splits_tiers_by_budget() {
        let snapshot = TierConfigSnapshot::default();
        let big = vec!["word"; 10_000].join(" ");
        let est = estimate(&big, &snapshot);
        assert!(est.requires_reduction.contains(&"basic".to_string()));
        assert!(est.fits.contains(&"forensic".to_string()));

        let small = "tiny document";
        let est = estimate(small, &snapshot);
        assert_eq!(est.requires_reduction.len(), 0);
        assert_eq!(est.fits.len(), 3);
    }
}
