//! Compiled-in analysis prompts, versioned so results can be traced back to
//! the prompt set that produced them.

use crate::types::Tier;

pub const PROMPT_VERSION: &str = "v2";

const BASIC_SYSTEM: &str = "\
You are a contract risk analyst. Read the contract text and produce a concise \
risk assessment as a single JSON object with exactly these keys: \
\"risk_level\" (one of \"high\", \"medium\", \"low\"), \"summary\" (3-5 sentence \
plain-language overview), and \"key_risks\" (array of up to 5 short strings, \
most severe first). Respond with JSON only, no surrounding prose.";

const PREMIUM_SYSTEM: &str = "\
You are a senior contract risk analyst. Read the contract text carefully and \
produce a thorough risk assessment as a single JSON object with exactly these \
keys: \"risk_level\" (one of \"high\", \"medium\", \"low\"), \"summary\" \
(detailed overview), \"key_risks\" (array of objects with \"clause\", \
\"severity\", and \"explanation\"), and \"recommendations\" (array of concrete \
next steps). Quote the relevant clause text where possible. Respond with JSON \
only, no surrounding prose.";

const FORENSIC_SYSTEM: &str = "\
You are a forensic contract examiner preparing material for legal review. \
Analyze the contract text exhaustively, clause by clause, and produce a single \
JSON object with exactly these keys: \"risk_level\" (one of \"high\", \
\"medium\", \"low\"), \"summary\" (executive overview), \"clauses\" (array of \
objects with \"clause\", \"text_excerpt\", \"severity\", \"analysis\", and \
\"cross_references\"), \"missing_protections\" (array of protections a \
well-drafted contract of this kind would contain but this one lacks), and \
\"recommendations\" (array of concrete next steps, most urgent first). \
Respond with JSON only, no surrounding prose.";

/// System prompt for a tier's analysis depth.
pub fn system_prompt(tier: Tier) -> &'static str {
    match tier {
        Tier::Basic => BASIC_SYSTEM,
        Tier::Premium => PREMIUM_SYSTEM,
        Tier::Forensic => FORENSIC_SYSTEM,
    }
}

/// Wrap the (possibly reduced) document text for the user turn.
pub fn user_prompt(document_text: &str) -> String {
    format!("Contract text to analyze:\n\n{document_text}")
}
