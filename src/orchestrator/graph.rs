// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! The declared stage graph.
//!
//! Stages and their dependency edges are fixed at startup; validation (cycle
//! detection, unknown names) is a fatal construction-time check, never a
//! runtime one.

use thiserror::Error;

use super::Stage;

pub struct StageNode {
    pub name: String,
    pub deps: Vec<String>,
    pub stage: Box<dyn Stage>,
}

pub struct StageGraph {
    nodes: Vec<StageNode>,
    /// Indices into `nodes` in a topological order consistent with the
    /// declared dependencies. Ties break on declaration order, so execution
    /// is deterministic.
    order: Vec<usize>,
}

impl StageGraph {
    pub fn new(nodes: Vec<StageNode>) -> Result<StageGraph, GraphError> {
        if nodes.is_empty() {
            return Err(GraphError::Empty);
        }
        for (i, node) in nodes.iter().enumerate() {
            if nodes[..i].iter().any(|n| n.name == node.name) {
                return Err(GraphError::DuplicateStage(node.name.clone()));
            }
        }
        for node in &nodes {
            for dep in &node.deps {
                if dep == &node.name {
                    return Err(GraphError::SelfDependency(node.name.clone()));
                }
                if !nodes.iter().any(|n| &n.name == dep) {
                    return Err(GraphError::UnknownDependency {
                        stage: node.name.clone(),
                        dep: dep.clone(),
                    });
                }
            }
        }

        // Kahn's algorithm, always taking the lowest-indexed ready node.
        let index_of = |name: &str| nodes.iter().position(|n| n.name == name).unwrap();
        // A dependency declared twice still contributes one edge.
        let mut in_degree: Vec<usize> = nodes
            .iter()
            .map(|n| {
                let mut deps = n.deps.clone();
                deps.sort();
                deps.dedup();
                deps.len()
            })
            .collect();
        let mut order = Vec::with_capacity(nodes.len());
        while order.len() < nodes.len() {
            let next = in_degree
                .iter()
                .enumerate()
                .find(|&(i, &d)| d == 0 && !order.contains(&i))
                .map(|(i, _)| i);
            let next = match next {
                Some(i) => i,
                None => {
                    let stuck: Vec<String> = nodes
                        .iter()
                        .enumerate()
                        .filter(|(i, _)| !order.contains(i))
                        .map(|(_, n)| n.name.clone())
                        .collect();
                    return Err(GraphError::Cycle(stuck.join(", ")));
                }
            };
            order.push(next);
            in_degree[next] = usize::MAX; // consumed
            for (i, node) in nodes.iter().enumerate() {
                if node.deps.iter().any(|d| index_of(d) == next) && in_degree[i] != usize::MAX {
                    in_degree[i] -= 1;
                }
            }
        }

        Ok(StageGraph { nodes, order })
    }

    /// Stages in execution order.
    pub fn execution_order(&self) -> impl Iterator<Item = &StageNode> {
        self.order.iter().map(move |&i| &self.nodes[i])
    }

    pub fn stage_names(&self) -> Vec<&str> {
        self.execution_order().map(|n| n.name.as_str()).collect()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}

#[derive(Debug, Error)]
pub enum GraphError {
    #[error("The stage graph has no stages")]
    Empty,

    #[error("Stage '{0}' is declared more than once")]
    DuplicateStage(String),

    #[error("Stage '{0}' depends on itself")]
    SelfDependency(String),

    #[error("Stage '{stage}' depends on undeclared stage '{dep}'")]
    UnknownDependency { stage: String, dep: String },

    #[error("The stage graph has a dependency cycle involving: {0}")]
    Cycle(String),
}
