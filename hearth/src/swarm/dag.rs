//! DAG validation and rendering for swarms: name/dependency checks,
//! depth-first cycle detection reporting the cycle path, dependency-condition
//! evaluation, and JSON / DOT views.

use std::collections::{HashMap, HashSet};

use super::{AgentSpec, SwarmError};
use crate::store::swarm::{SwarmAgentRow, SwarmRow};

/// Validates a declared agent list: unique names, every dependency refers to
/// a declared agent, and the graph is acyclic. Runs before anything is
/// persisted, so a failing spec leaves no rows behind.
pub fn validate(agents: &[AgentSpec]) -> Result<(), SwarmError> {
    if agents.is_empty() {
        return Err(SwarmError::Validation("swarm has no agents".into()));
    }
    let mut names = HashSet::new();
    for agent in agents {
        if agent.name.trim().is_empty() {
            return Err(SwarmError::Validation("agent name is empty".into()));
        }
        if !names.insert(agent.name.as_str()) {
            return Err(SwarmError::Validation(format!(
                "duplicate agent name: {}",
                agent.name
            )));
        }
    }
    for agent in agents {
        for dep in &agent.depends_on {
            if !names.contains(dep.agent.as_str()) {
                return Err(SwarmError::Validation(format!(
                    "agent '{}' depends on unknown agent '{}'",
                    agent.name, dep.agent
                )));
            }
        }
    }
    detect_cycle(agents)
}

/// Depth-first cycle detection. On failure the error carries the cycle path
/// (first node repeated at the end).
fn detect_cycle(agents: &[AgentSpec]) -> Result<(), SwarmError> {
    let deps: HashMap<&str, Vec<&str>> = agents
        .iter()
        .map(|a| {
            (
                a.name.as_str(),
                a.depends_on.iter().map(|d| d.agent.as_str()).collect(),
            )
        })
        .collect();

    #[derive(Clone, Copy, PartialEq)]
    enum Mark {
        Visiting,
        Done,
    }

    fn visit<'a>(
        node: &'a str,
        deps: &HashMap<&'a str, Vec<&'a str>>,
        marks: &mut HashMap<&'a str, Mark>,
        stack: &mut Vec<&'a str>,
    ) -> Option<Vec<String>> {
        match marks.get(node) {
            Some(Mark::Done) => return None,
            Some(Mark::Visiting) => {
                let start = stack.iter().position(|n| *n == node).unwrap_or(0);
                let mut path: Vec<String> = stack[start..].iter().map(|s| s.to_string()).collect();
                path.push(node.to_string());
                return Some(path);
            }
            None => {}
        }
        marks.insert(node, Mark::Visiting);
        stack.push(node);
        for dep in deps.get(node).into_iter().flatten() {
            if let Some(cycle) = visit(dep, deps, marks, stack) {
                return Some(cycle);
            }
        }
        stack.pop();
        marks.insert(node, Mark::Done);
        None
    }

    let mut marks = HashMap::new();
    let mut stack = Vec::new();
    for agent in agents {
        if let Some(path) = visit(agent.name.as_str(), &deps, &mut marks, &mut stack) {
            return Err(SwarmError::Cycle { path });
        }
    }
    Ok(())
}

/// Evaluates a dependency condition against the dependency's output.
///
/// Forms: `contains '<text>'`, `not contains '<text>'`, `equals '<text>'`;
/// anything else is treated as a bare substring check. Quotes (single or
/// double) around the operand are optional.
pub fn eval_condition(condition: &str, output: &str) -> bool {
    let c = condition.trim();
    if let Some(rest) = c.strip_prefix("not contains ") {
        !output.contains(unquote(rest))
    } else if let Some(rest) = c.strip_prefix("contains ") {
        output.contains(unquote(rest))
    } else if let Some(rest) = c.strip_prefix("equals ") {
        output.trim() == unquote(rest)
    } else {
        output.contains(unquote(c))
    }
}

fn unquote(s: &str) -> &str {
    let s = s.trim();
    for q in ['\'', '"'] {
        if s.len() >= 2 && s.starts_with(q) && s.ends_with(q) {
            return &s[1..s.len() - 1];
        }
    }
    s
}

/// JSON view of a persisted swarm DAG.
pub fn render_json(swarm: &SwarmRow, agents: &[SwarmAgentRow]) -> serde_json::Value {
    let by_id: HashMap<&str, &str> = agents
        .iter()
        .map(|a| (a.id.as_str(), a.name.as_str()))
        .collect();
    let nodes: Vec<serde_json::Value> = agents
        .iter()
        .map(|a| {
            serde_json::json!({
                "id": a.id,
                "name": a.name,
                "role": a.role,
                "mode": a.mode,
                "status": a.status.as_str(),
            })
        })
        .collect();
    let mut edges = Vec::new();
    for agent in agents {
        for dep in &agent.depends_on {
            edges.push(serde_json::json!({
                "from": by_id.get(dep.agent_id.as_str()).copied().unwrap_or(dep.agent_id.as_str()),
                "to": agent.name,
                "include": dep.include,
                "condition": dep.condition,
            }));
        }
    }
    serde_json::json!({
        "swarm": swarm.id,
        "name": swarm.name,
        "status": swarm.status.as_str(),
        "nodes": nodes,
        "edges": edges,
    })
}

/// DOT view of a persisted swarm DAG; status shapes the node fill.
pub fn render_dot(swarm: &SwarmRow, agents: &[SwarmAgentRow]) -> String {
    let by_id: HashMap<&str, &str> = agents
        .iter()
        .map(|a| (a.id.as_str(), a.name.as_str()))
        .collect();
    let mut out = String::new();
    out.push_str(&format!("digraph \"{}\" {{\n", swarm.name.replace('"', "'")));
    out.push_str("  rankdir=LR;\n  node [shape=box, style=filled];\n");
    for agent in agents {
        let fill = match agent.status.as_str() {
            "completed" => "palegreen",
            "failed" => "lightcoral",
            "running" => "lightblue",
            "skipped" | "cancelled" => "lightgray",
            _ => "white",
        };
        out.push_str(&format!(
            "  \"{}\" [fillcolor={}, label=\"{}\\n{}\"];\n",
            agent.name,
            fill,
            agent.name.replace('"', "'"),
            agent.status.as_str(),
        ));
    }
    for agent in agents {
        for dep in &agent.depends_on {
            let from = by_id
                .get(dep.agent_id.as_str())
                .copied()
                .unwrap_or(dep.agent_id.as_str());
            let style = if dep.condition.is_some() {
                " [style=dashed]"
            } else {
                ""
            };
            out.push_str(&format!("  \"{}\" -> \"{}\"{};\n", from, agent.name, style));
        }
    }
    out.push_str("}\n");
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::swarm::AgentSpec;

    fn agent(name: &str) -> AgentSpec {
        AgentSpec::new(name, "do work")
    }

    #[test]
    fn valid_diamond_passes() {
        let agents = vec![
            agent("a"),
            agent("b").depends_on_full("a"),
            agent("c").depends_on_full("a"),
            agent("d").depends_on_full("b").depends_on_full("c"),
        ];
        assert!(validate(&agents).is_ok());
    }

    #[test]
    fn duplicate_name_is_validation_error() {
        let agents = vec![agent("a"), agent("a")];
        let err = validate(&agents).unwrap_err();
        assert!(matches!(err, SwarmError::Validation(_)));
        assert!(err.to_string().contains("duplicate"));
    }

    #[test]
    fn unknown_dependency_is_validation_error() {
        let agents = vec![agent("a").depends_on_full("ghost")];
        let err = validate(&agents).unwrap_err();
        assert!(err.to_string().contains("unknown agent 'ghost'"));
    }

    #[test]
    fn cycle_is_reported_with_path() {
        let agents = vec![
            agent("a").depends_on_full("c"),
            agent("b").depends_on_full("a"),
            agent("c").depends_on_full("b"),
        ];
        let err = validate(&agents).unwrap_err();
        match err {
            SwarmError::Cycle { path } => {
                assert_eq!(path.len(), 4);
                assert_eq!(path.first(), path.last());
                for name in ["a", "b", "c"] {
                    assert!(path.contains(&name.to_string()), "missing {} in {:?}", name, path);
                }
            }
            other => panic!("expected cycle, got {:?}", other),
        }
    }

    #[test]
    fn self_dependency_is_a_cycle() {
        let agents = vec![agent("a").depends_on_full("a")];
        assert!(matches!(
            validate(&agents).unwrap_err(),
            SwarmError::Cycle { .. }
        ));
    }

    #[test]
    fn empty_swarm_is_rejected() {
        assert!(validate(&[]).is_err());
    }

    #[test]
    fn condition_forms() {
        assert!(eval_condition("contains 'ok'", "status: ok"));
        assert!(!eval_condition("contains 'ok'", "status: bad"));
        assert!(eval_condition("not contains 'error'", "all fine"));
        assert!(!eval_condition("not contains 'error'", "error: boom"));
        assert!(eval_condition("equals 'done'", "  done  "));
        assert!(eval_condition("\"ok\"", "status ok here"));
        assert!(eval_condition("plain", "contains plain text"));
    }
}
