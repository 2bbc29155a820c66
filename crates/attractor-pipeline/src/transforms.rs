//! AST transforms for pipeline graphs.
//!
//! Processes the pipeline graph after parsing: applies stylesheets, expands
//! variables in prompts, and performs other AST-level transformations.

use std::collections::HashMap;

use crate::graph::PipelineGraph;
use crate::stylesheet::{apply_stylesheet, parse_stylesheet};

/// Apply all transforms to a pipeline graph in the correct order.
pub fn apply_transforms(graph: &mut PipelineGraph) -> attractor_types::Result<()> {
    // 1. Apply model stylesheet (if present in graph attrs)
    apply_model_stylesheet(graph)?;

    // 2. Expand variables in prompts
    expand_prompt_variables(graph);

    Ok(())
}

/// Apply model stylesheet from graph attributes.
fn apply_model_stylesheet(graph: &mut PipelineGraph) -> attractor_types::Result<()> {
    let stylesheet_str = graph
        .attrs
        .get("model_stylesheet")
        .and_then(|v| match v {
            attractor_dot::AttributeValue::String(s) => Some(s.clone()),
            _ => None,
        });

    if let Some(css) = stylesheet_str {
        let stylesheet = parse_stylesheet(&css)?;
        apply_stylesheet(graph, &stylesheet);
    }

    Ok(())
}

/// Expand `${variable}` references in node prompts using graph-level attributes.
fn expand_prompt_variables(graph: &mut PipelineGraph) {
    // Collect graph-level attribute values for substitution
    let vars: HashMap<String, String> = graph
        .attrs
        .iter()
        .filter_map(|(k, v)| match v {
            attractor_dot::AttributeValue::String(s) => Some((k.clone(), s.clone())),
            attractor_dot::AttributeValue::Integer(i) => Some((k.clone(), i.to_string())),
            attractor_dot::AttributeValue::Boolean(b) => Some((k.clone(), b.to_string())),
            attractor_dot::AttributeValue::Float(f) => Some((k.clone(), f.to_string())),
            attractor_dot::AttributeValue::Duration(_) => None,
        })
        .collect();

    for node in graph.all_nodes_mut() {
        if let Some(ref prompt) = node.prompt {
            let expanded = expand_variables(prompt, &vars);
            if expanded != *prompt {
                node.prompt = Some(expanded);
            }
        }
    }
}

/// Expand `${variable}` patterns in a string.
///
/// Replaces each occurrence of `${key}` with the corresponding value from `vars`.
/// Variables that do not appear in `vars` are left as-is.
pub fn expand_variables(template: &str, vars: &HashMap<String, String>) -> String {
    let mut result = template.to_string();
    for (key, value) in vars {
        let pattern = format!("${{{}}}", key);
        result = result.replace(&pattern, value);
    }
    result
}

/// Expand `$goal` and `$context.<key>` references against the live goal
/// string and context snapshot. Unlike [`expand_variables`], which runs once
/// at graph-build time against graph-level attributes, this is evaluated by
/// the engine before every node invocation so it always sees the current
/// context.
pub fn expand_goal_context_vars(
    template: &str,
    goal: &str,
    context: &HashMap<String, serde_json::Value>,
) -> String {
    if !template.contains('$') {
        return template.to_string();
    }
    let re = regex::Regex::new(r"\$context\.([A-Za-z_][A-Za-z0-9_]*)|\$goal").unwrap();
    re.replace_all(template, |caps: &regex::Captures| {
        if let Some(key) = caps.get(1) {
            context
                .get(key.as_str())
                .map(|v| match v {
                    serde_json::Value::String(s) => s.clone(),
                    other => other.to_string(),
                })
                .unwrap_or_default()
        } else {
            goal.to_string()
        }
    })
    .into_owned()
}
