//! Server-side access control for the reserved `_debug` key on analysis
//! summaries.
//!
//! Stripping happens before a record leaves the store layer, so no transport
//! ever carries debug metadata to a caller who should not see it. Privileged
//! callers receive the summary structurally unchanged.

use serde_json::Value;

use crate::types::{AnalysisRecord, RequestContext};

/// Reserved top-level key for diagnostic metadata.
pub const DEBUG_KEY: &str = "_debug";

/// Whether this caller may see debug metadata.
fn debug_allowed(ctx: &RequestContext) -> bool {
    ctx.privileged || ctx.debug_enabled
}

/// Strip the top-level `_debug` key unless the caller is allowed to see it.
pub fn sanitize_summary(mut summary: Value, ctx: &RequestContext) -> Value {
    if debug_allowed(ctx) {
        return summary;
    }
    if let Some(obj) = summary.as_object_mut() {
        obj.remove(DEBUG_KEY);
    }
    summary
}

/// Apply the gate to a full record in place.
pub fn sanitize_record(record: &mut AnalysisRecord, ctx: &RequestContext) {
    if let Some(summary) = record.summary.take() {
        record.summary = Some(sanitize_summary(summary, ctx));
    }
}
