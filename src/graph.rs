use std::collections::{BTreeMap, HashMap};

use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::{algo, Direction};

use super::state::{ReleaseId, ReleaseSpec};
use super::{ErrorKind, Result};

/// How to treat `needs` targets that the selector filtered out
#[derive(Clone, Copy, Debug, Default)]
pub struct NeedsOpts {
    /// Prune edges to deselected releases
    pub skip_needs: bool,
    /// Pull directly needed releases back into the selection
    pub include_needs: bool,
    /// Pull the whole needs closure back into the selection
    pub include_transitive_needs: bool,
}

/// The release dependency graph; edges point dependency -> dependent
pub type ReleaseGraph = DiGraph<ReleaseSpec, ()>;

/// Topologically grouped execution order
///
/// Releases within one group are independent and may run in parallel;
/// group k+1 only starts after group k is terminal.
#[derive(Debug, Default)]
pub struct Plan {
    pub groups: Vec<Vec<ReleaseSpec>>,
}

impl Plan {
    /// Destructive operations process dependents before dependencies
    pub fn reversed(mut self) -> Plan {
        self.groups.reverse();
        self
    }

    pub fn releases(&self) -> impl Iterator<Item = &ReleaseSpec> {
        self.groups.iter().flatten()
    }

    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }
}

/// Build and validate the dependency plan for a selected release subset
///
/// `all` is the unfiltered (enabled) release list of the same state, used
/// to distinguish "filtered out by the selector" from "does not exist".
pub fn plan(
    selected: &[ReleaseSpec],
    all: &[ReleaseSpec],
    opts: &NeedsOpts,
    v3: bool,
) -> Result<Plan> {
    let unfiltered: BTreeMap<ReleaseId, &ReleaseSpec> =
        all.iter().map(|r| (r.id(v3), r)).collect();

    let mut selection: Vec<ReleaseSpec> = selected.to_vec();
    if opts.include_needs || opts.include_transitive_needs {
        let mut have: BTreeMap<ReleaseId, ()> =
            selection.iter().map(|r| (r.id(v3), ())).collect();
        let mut cursor = 0;
        while cursor < selection.len() {
            // plain include-needs only scans the original selection
            if !opts.include_transitive_needs && cursor >= selected.len() {
                break;
            }
            let needs: Vec<ReleaseId> = {
                let r = &selection[cursor];
                r.needs.iter().map(|n| r.need_id(n, v3)).collect()
            };
            let dependent = selection[cursor].name.clone();
            for nid in needs {
                if have.contains_key(&nid) {
                    continue;
                }
                match unfiltered.get(&nid) {
                    Some(spec) => {
                        debug!("including needed release {} for {}", nid, dependent);
                        have.insert(nid, ());
                        selection.push((*spec).clone());
                    }
                    None => bail!(ErrorKind::UndefinedNeeds(dependent.clone(), nid.to_string())),
                }
            }
            cursor += 1;
        }
    }

    let mut graph = ReleaseGraph::new();
    let mut index: HashMap<ReleaseId, NodeIndex> = HashMap::new();
    for r in &selection {
        let id = r.id(v3);
        let idx = graph.add_node(r.clone());
        index.insert(id, idx);
    }

    for r in &selection {
        let idx = index[&r.id(v3)];
        for need in &r.needs {
            let nid = r.need_id(need, v3);
            if let Some(dep_idx) = index.get(&nid) {
                graph.update_edge(*dep_idx, idx, ());
            } else if unfiltered.contains_key(&nid) {
                if opts.skip_needs {
                    debug!("skipping deselected dependency {} of {}", nid, r.name);
                } else {
                    bail!(ErrorKind::FilteredNeeds(r.name.clone(), nid.to_string()));
                }
            } else {
                bail!(ErrorKind::UndefinedNeeds(r.name.clone(), nid.to_string()));
            }
        }
    }

    if let Err(cycle) = algo::toposort(&graph, None) {
        let name = graph
            .node_weight(cycle.node_id())
            .map(|r| r.name.clone())
            .unwrap_or_default();
        bail!(ErrorKind::CyclicDependency(name));
    }

    Ok(Plan {
        groups: layer(&graph),
    })
}

/// Kahn-style layering: repeatedly peel off the zero-indegree frontier
fn layer(graph: &ReleaseGraph) -> Vec<Vec<ReleaseSpec>> {
    let mut indegree: HashMap<NodeIndex, usize> = graph
        .node_indices()
        .map(|i| (i, graph.neighbors_directed(i, Direction::Incoming).count()))
        .collect();
    let mut remaining: Vec<NodeIndex> = graph.node_indices().collect();
    let mut groups = vec![];

    while !remaining.is_empty() {
        let frontier: Vec<NodeIndex> = remaining
            .iter()
            .cloned()
            .filter(|i| indegree[i] == 0)
            .collect();
        if frontier.is_empty() {
            // acyclicity was checked before layering
            unreachable!("dependency graph contains a cycle after validation");
        }
        for idx in &frontier {
            for succ in graph.neighbors_directed(*idx, Direction::Outgoing) {
                if let Some(d) = indegree.get_mut(&succ) {
                    *d = d.saturating_sub(1);
                }
            }
        }
        remaining.retain(|i| !frontier.contains(i));
        groups.push(
            frontier
                .into_iter()
                .map(|i| graph[i].clone())
                .collect::<Vec<_>>(),
        );
    }
    groups
}

#[cfg(test)]
mod tests {
    use super::{plan, NeedsOpts};
    use crate::state::ReleaseSpec;

    fn release(name: &str, needs: &[&str]) -> ReleaseSpec {
        let mut r = ReleaseSpec::default();
        r.name = name.into();
        r.namespace = "default".into();
        r.chart = format!("c/{}", name);
        r.needs = needs.iter().map(|s| s.to_string()).collect();
        r._enabled = true;
        r
    }

    fn names(groups: &[Vec<ReleaseSpec>]) -> Vec<Vec<String>> {
        groups
            .iter()
            .map(|g| g.iter().map(|r| r.name.clone()).collect())
            .collect()
    }

    #[test]
    fn orders_dependencies_first() {
        let rs = vec![release("foo", &["bar"]), release("bar", &[])];
        let p = plan(&rs, &rs, &NeedsOpts::default(), true).unwrap();
        assert_eq!(names(&p.groups), vec![vec!["bar"], vec!["foo"]]);
        let reversed = plan(&rs, &rs, &NeedsOpts::default(), true).unwrap().reversed();
        assert_eq!(names(&reversed.groups), vec![vec!["foo"], vec!["bar"]]);
    }

    #[test]
    fn independent_releases_share_a_group() {
        let rs = vec![
            release("a", &[]),
            release("b", &["a"]),
            release("c", &["a"]),
            release("d", &["b", "c"]),
        ];
        let p = plan(&rs, &rs, &NeedsOpts::default(), true).unwrap();
        assert_eq!(names(&p.groups), vec![vec!["a"], vec!["b", "c"], vec!["d"]]);
    }

    #[test]
    fn cycles_are_fatal() {
        let rs = vec![release("a", &["b"]), release("b", &["a"])];
        let err = plan(&rs, &rs, &NeedsOpts::default(), true).unwrap_err();
        assert!(err.to_string().contains("circular dependency"));
    }

    #[test]
    fn nonexistent_needs_are_fatal() {
        let rs = vec![release("a", &["ghost"])];
        let err = plan(&rs, &rs, &NeedsOpts::default(), true).unwrap_err();
        assert!(err
            .to_string()
            .contains("depends on nonexistent release \"default/default/ghost\""));
    }

    #[test]
    fn filtered_needs_require_a_flag() {
        let all = vec![release("a", &["b"]), release("b", &[])];
        let selected = vec![all[0].clone()];

        let err = plan(&selected, &all, &NeedsOpts::default(), true).unwrap_err();
        assert!(err.to_string().contains("--skip-needs"));
        assert!(err.to_string().contains("--include-needs"));

        let skipped = plan(
            &selected,
            &all,
            &NeedsOpts {
                skip_needs: true,
                ..Default::default()
            },
            true,
        )
        .unwrap();
        assert_eq!(names(&skipped.groups), vec![vec!["a"]]);

        let included = plan(
            &selected,
            &all,
            &NeedsOpts {
                include_needs: true,
                ..Default::default()
            },
            true,
        )
        .unwrap();
        assert_eq!(names(&included.groups), vec![vec!["b"], vec!["a"]]);
    }

    #[test]
    fn transitive_include_pulls_the_closure() {
        let all = vec![
            release("a", &["b"]),
            release("b", &["c"]),
            release("c", &[]),
        ];
        let selected = vec![all[0].clone()];

        // plain include only reaches one hop, the next one still fails
        let err = plan(
            &selected,
            &all,
            &NeedsOpts {
                include_needs: true,
                ..Default::default()
            },
            true,
        )
        .unwrap_err();
        assert!(err.to_string().contains("\"default/default/c\""));

        let p = plan(
            &selected,
            &all,
            &NeedsOpts {
                include_needs: true,
                include_transitive_needs: true,
                ..Default::default()
            },
            true,
        )
        .unwrap();
        assert_eq!(names(&p.groups), vec![vec!["c"], vec!["b"], vec!["a"]]);
    }

    #[test]
    fn needs_resolve_across_namespaces() {
        let mut db = release("db", &[]);
        db.namespace = "infra".into();
        let mut api = release("api", &["infra/db"]);
        api.namespace = "prod".into();
        let rs = vec![api, db];
        let p = plan(&rs, &rs, &NeedsOpts::default(), true).unwrap();
        assert_eq!(names(&p.groups), vec![vec!["db"], vec!["api"]]);
    }
}
