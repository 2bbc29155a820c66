//! 5-step edge selection algorithm.
//!
//! After a node completes, this module determines which outgoing edge to follow
//! based on a priority cascade: condition match, preferred label, suggested next
//! IDs, highest weight, and lexical tiebreak.

use crate::condition::{evaluate_condition, parse_condition};
use crate::graph::{PipelineEdge, PipelineGraph};

/// Select the next edge to follow after a node completes.
/// Returns `None` if no edges are available (terminal node).
pub fn select_edge<'a>(
    node_id: &str,
    outcome: &attractor_types::Outcome,
    resolve: &dyn Fn(&str) -> String,
    graph: &'a PipelineGraph,
) -> Option<&'a PipelineEdge> {
    let edges = graph.outgoing_edges(node_id);
    if edges.is_empty() {
        return None;
    }

    // Step 1: establish the candidate set. Conditional edges whose condition
    // evaluates true take over the candidate set entirely; otherwise the
    // candidate set is every unconditional edge. Steps 2-5 only ever look at
    // this candidate set, never at the edges it excluded.
    let condition_matches: Vec<_> = edges
        .iter()
        .filter(|e| {
            e.condition.as_deref().is_some_and(|cond| {
                parse_condition(cond)
                    .map(|expr| evaluate_condition(&expr, resolve))
                    .unwrap_or(false)
            })
        })
        .collect();

    let candidates: Vec<&PipelineEdge> = if !condition_matches.is_empty() {
        condition_matches
    } else {
        edges.iter().filter(|e| e.condition.is_none()).collect()
    };
    if candidates.is_empty() {
        return None;
    }

    // Step 2: preferred label match
    if let Some(ref label) = outcome.preferred_label {
        let normalized = normalize_label(label);
        for edge in &candidates {
            if let Some(ref elabel) = edge.label {
                if normalize_label(elabel) == normalized {
                    return Some(edge);
                }
            }
        }
    }

    // Step 3: suggested next IDs, in suggestion order
    for suggested in &outcome.suggested_next_ids {
        if let Some(edge) = candidates.iter().find(|e| e.to == *suggested) {
            return Some(edge);
        }
    }

    // Step 4 & 5: highest priority/weight, lexical tiebreak on target id
    Some(best_by_weight_then_lexical(&candidates))
}

/// Normalize a label for comparison: lowercase, strip accelerator prefixes like
/// `[Y]`, `Y)`, `Y-`.
fn normalize_label(label: &str) -> String {
    let s = label.trim().to_lowercase();
    // Strip accelerator prefixes: [Y] , Y) , Y- , and a bare `&` marker as
    // used by Wait-for-Human edge labels (e.g. "&Yes").
    let s = s.strip_prefix('&').unwrap_or(&s).to_string();
    regex::Regex::new(r"^(?:\[\w\]\s*|\w\)\s*|\w-\s*)")
        .unwrap()
        .replace(&s, "")
        .to_string()
}

/// Pick the edge with the highest explicit `priority` (an edge with a
/// priority always outranks one without), then the highest `weight`, then
/// break ties by lexicographically smallest `to` field.
fn best_by_weight_then_lexical<'a>(edges: &[&'a PipelineEdge]) -> &'a PipelineEdge {
    edges
        .iter()
        .copied()
        .max_by(|a, b| {
            a.priority
                .is_some()
                .cmp(&b.priority.is_some())
                .then(a.priority.unwrap_or(i32::MIN).cmp(&b.priority.unwrap_or(i32::MIN)))
                .then(a.weight.cmp(&b.weight))
                .then(b.to.cmp(&a.to)) // lexical ascending = reverse compare
        })
        .unwrap()
}
