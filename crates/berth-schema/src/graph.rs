//! Machine link graph and start ordering.
//!
//! Edges run from a dependency to the machine linking to it, so a topological
//! order starts dependencies first. Machines in the same level have no link
//! between them and may start concurrently.

use crate::environment::Environment;
use crate::manifest::ManifestError;
use petgraph::algo::{tarjan_scc, toposort};
use petgraph::graph::{DiGraph, NodeIndex};
use std::collections::{BTreeMap, BTreeSet};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StartPlan {
    levels: Vec<Vec<String>>,
    order: Vec<String>,
    dependencies: BTreeMap<String, BTreeSet<String>>,
}

impl StartPlan {
    pub fn new(env: &Environment) -> Result<Self, ManifestError> {
        let mut graph: DiGraph<&str, ()> = DiGraph::new();
        let index: BTreeMap<&str, NodeIndex> = env
            .machines()
            .keys()
            .map(|name| (name.as_str(), graph.add_node(name.as_str())))
            .collect();

        let mut dependencies: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
        for (name, config) in env.machines() {
            let mut deps = BTreeSet::new();
            for link in &config.links {
                if link.target == *name {
                    return Err(ManifestError::SelfLink(name.clone()));
                }
                let Some(&dep_idx) = index.get(link.target.as_str()) else {
                    return Err(ManifestError::UnknownLinkTarget {
                        machine: name.clone(),
                        target: link.target.clone(),
                    });
                };
                graph.update_edge(dep_idx, index[name.as_str()], ());
                deps.insert(link.target.clone());
            }
            dependencies.insert(name.clone(), deps);
        }

        if toposort(&graph, None).is_err() {
            let mut members: Vec<String> = tarjan_scc(&graph)
                .into_iter()
                .filter(|scc| scc.len() > 1)
                .flatten()
                .map(|idx| String::from(graph[idx]))
                .collect();
            members.sort();
            return Err(ManifestError::DependencyCycle(members));
        }

        let levels = compute_levels(&dependencies);
        let order = levels.iter().flatten().cloned().collect();

        Ok(Self {
            levels,
            order,
            dependencies,
        })
    }

    /// Machines in start order: every machine follows all of its dependencies.
    pub fn order(&self) -> &[String] {
        &self.order
    }

    /// Groups of machines whose dependencies all live in earlier groups.
    pub fn levels(&self) -> &[Vec<String>] {
        &self.levels
    }

    pub fn dependencies(&self, machine: &str) -> Option<&BTreeSet<String>> {
        self.dependencies.get(machine)
    }

    /// Machines that link to `machine`.
    pub fn dependents<'a>(&'a self, machine: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.dependencies
            .iter()
            .filter(move |(_, deps)| deps.contains(machine))
            .map(|(name, _)| name.as_str())
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}

// Caller guarantees the graph is acyclic.
fn compute_levels(dependencies: &BTreeMap<String, BTreeSet<String>>) -> Vec<Vec<String>> {
    let mut placed: BTreeSet<&str> = BTreeSet::new();
    let mut levels = Vec::new();

    while placed.len() < dependencies.len() {
        let level: Vec<&str> = dependencies
            .iter()
            .filter(|(name, deps)| {
                !placed.contains(name.as_str()) && deps.iter().all(|d| placed.contains(d.as_str()))
            })
            .map(|(name, _)| name.as_str())
            .collect();
        if level.is_empty() {
            break;
        }
        placed.extend(level.iter().copied());
        levels.push(level.into_iter().map(str::to_owned).collect());
    }

    levels
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::environment::{Link, MachineConfig, DEFAULT_ENV_TYPE};

    fn env(machines: &[(&str, &[&str])]) -> Environment {
        let mut env = Environment::new("test", DEFAULT_ENV_TYPE);
        for (name, links) in machines {
            let mut config = MachineConfig::from_image("alpine");
            for link in *links {
                config = config.link(Link::parse(link).unwrap());
            }
            env.insert_machine(*name, config);
        }
        env
    }

    #[test]
    fn dependency_starts_first() {
        let plan = StartPlan::new(&env(&[("app", &["db"]), ("db", &[])])).unwrap();
        assert_eq!(plan.order(), ["db", "app"]);
        assert_eq!(plan.levels(), [vec!["db".to_owned()], vec!["app".to_owned()]]);
    }

    #[test]
    fn independent_machines_share_a_level() {
        let plan = StartPlan::new(&env(&[
            ("app", &["db", "cache:redis"]),
            ("cache", &[]),
            ("db", &[]),
            ("worker", &["db"]),
        ]))
        .unwrap();
        assert_eq!(plan.levels().len(), 2);
        assert_eq!(plan.levels()[0], ["cache", "db"]);
        assert_eq!(plan.levels()[1], ["app", "worker"]);
        let dependents: Vec<&str> = plan.dependents("db").collect();
        assert_eq!(dependents, ["app", "worker"]);
    }

    #[test]
    fn chain_produces_one_machine_per_level() {
        let plan = StartPlan::new(&env(&[("a", &["b"]), ("b", &["c"]), ("c", &[])])).unwrap();
        assert_eq!(plan.order(), ["c", "b", "a"]);
        assert_eq!(plan.levels().len(), 3);
        assert!(plan.dependencies("a").unwrap().contains("b"));
    }

    #[test]
    fn cycle_is_rejected_with_members() {
        let err = StartPlan::new(&env(&[("a", &["b"]), ("b", &["a"]), ("c", &[])])).unwrap_err();
        match err {
            ManifestError::DependencyCycle(members) => assert_eq!(members, ["a", "b"]),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn self_link_is_rejected() {
        let err = StartPlan::new(&env(&[("a", &["a"])])).unwrap_err();
        assert!(matches!(err, ManifestError::SelfLink(m) if m == "a"));
    }

    #[test]
    fn unknown_link_target_is_rejected() {
        let err = StartPlan::new(&env(&[("app", &["db"])])).unwrap_err();
        assert!(matches!(
            err,
            ManifestError::UnknownLinkTarget { ref target, .. } if target == "db"
        ));
    }
}
