use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::channel;
use std::sync::Arc;

use threadpool::ThreadPool;

use super::graph::Plan;
use super::state::{ReleaseId, ReleaseSpec};
use super::Result;

/// Terminal outcome for one release operation
#[derive(Clone, Debug, PartialEq)]
pub enum Outcome {
    /// Success; for diff: no changes
    Ok,
    /// Diff reported changes (engine sentinel exit code 2)
    Changed,
    /// The release failed but peers and later groups may continue
    Error(String),
    /// Stop scheduling any further groups
    Fatal(String),
}

impl Outcome {
    pub fn is_failure(&self) -> bool {
        match self {
            Outcome::Error(_) | Outcome::Fatal(_) => true,
            _ => false,
        }
    }
}

/// Whether an `Error` outcome stops the next group
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum FailurePolicy {
    /// apply/sync: a failed group gates everything after it
    HaltOnError,
    /// diff/lint/test: collect failures across all groups
    Aggregate,
}

#[derive(Debug, Default)]
pub struct ExecResult {
    pub outcomes: Vec<(ReleaseId, Outcome)>,
    /// True when a fatal outcome or the failure policy cut the run short
    pub halted: bool,
}

impl ExecResult {
    pub fn changed(&self) -> Vec<&ReleaseId> {
        self.outcomes
            .iter()
            .filter(|(_, o)| *o == Outcome::Changed)
            .map(|(id, _)| id)
            .collect()
    }

    pub fn failures(&self) -> Vec<(&ReleaseId, &str)> {
        self.outcomes
            .iter()
            .filter_map(|(id, o)| match o {
                Outcome::Error(msg) | Outcome::Fatal(msg) => Some((id, msg.as_str())),
                _ => None,
            })
            .collect()
    }

    pub fn ok(&self) -> bool {
        !self.halted && self.failures().is_empty()
    }
}

/// Run a plan group by group with bounded parallelism
///
/// Group k+1 starts only after every release in group k reached a terminal
/// outcome. Within a group no ordering is guaranteed; `concurrency: 1`
/// makes the whole run deterministic.
pub fn run_groups<F>(
    plan: &Plan,
    concurrency: usize,
    policy: FailurePolicy,
    v3: bool,
    cancel: &Arc<AtomicBool>,
    worker: F,
) -> Result<ExecResult>
where
    F: Fn(ReleaseSpec) -> Outcome + Send + Sync + 'static,
{
    let worker = Arc::new(worker);
    let mut result = ExecResult::default();

    for (gi, group) in plan.groups.iter().enumerate() {
        if group.is_empty() {
            continue;
        }
        let n_jobs = group.len();
        let n_workers = if concurrency == 0 {
            n_jobs
        } else {
            concurrency.min(n_jobs)
        };
        debug!(
            "processing group {}/{} ({} releases, {} workers)",
            gi + 1,
            plan.groups.len(),
            n_jobs,
            n_workers
        );
        let pool = ThreadPool::new(n_workers);
        let (tx, rx) = channel();

        let mut dispatched = 0;
        for release in group {
            if cancel.load(Ordering::SeqCst) {
                info!("cancellation requested, not scheduling {}", release.name);
                result.halted = true;
                break;
            }
            let release = release.clone();
            let id = release.id(v3);
            let worker = worker.clone();
            let tx = tx.clone();
            dispatched += 1;
            pool.execute(move || {
                let outcome = (*worker)(release);
                tx.send((id, outcome)).expect("channel will be there waiting for the pool");
            });
        }

        // group barrier: drain every dispatched job
        let mut group_fatal = false;
        let mut group_error = false;
        for (id, outcome) in rx.iter().take(dispatched) {
            match &outcome {
                Outcome::Ok => debug!("{} done", id),
                Outcome::Changed => debug!("{} changed", id),
                Outcome::Error(e) => {
                    error!("{} failed: {}", id, e);
                    group_error = true;
                }
                Outcome::Fatal(e) => {
                    error!("{} failed fatally: {}", id, e);
                    group_fatal = true;
                }
            }
            result.outcomes.push((id, outcome));
        }
        pool.join();

        if group_fatal || result.halted {
            result.halted = true;
            break;
        }
        if group_error && policy == FailurePolicy::HaltOnError {
            result.halted = true;
            break;
        }
    }

    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::{run_groups, FailurePolicy, Outcome};
    use crate::graph::Plan;
    use crate::state::ReleaseSpec;
    use std::sync::atomic::AtomicBool;
    use std::sync::{Arc, Mutex};

    fn release(name: &str) -> ReleaseSpec {
        let mut r = ReleaseSpec::default();
        r.name = name.into();
        r.namespace = "default".into();
        r._enabled = true;
        r
    }

    fn plan_of(groups: Vec<Vec<&str>>) -> Plan {
        Plan {
            groups: groups
                .into_iter()
                .map(|g| g.into_iter().map(release).collect())
                .collect(),
        }
    }

    #[test]
    fn groups_run_in_order_with_concurrency_one() {
        let plan = plan_of(vec![vec!["a", "b"], vec!["c"]]);
        let seen = Arc::new(Mutex::new(vec![]));
        let seen2 = seen.clone();
        let cancel = Arc::new(AtomicBool::new(false));
        let res = run_groups(&plan, 1, FailurePolicy::HaltOnError, true, &cancel, move |r| {
            seen2.lock().unwrap().push(r.name.clone());
            Outcome::Ok
        })
        .unwrap();
        assert!(res.ok());
        assert_eq!(*seen.lock().unwrap(), vec!["a", "b", "c"]);
    }

    #[test]
    fn error_halts_next_group_under_halt_policy() {
        let plan = plan_of(vec![vec!["a"], vec!["b"]]);
        let cancel = Arc::new(AtomicBool::new(false));
        let res = run_groups(&plan, 1, FailurePolicy::HaltOnError, true, &cancel, |r| {
            if r.name == "a" {
                Outcome::Error("boom".into())
            } else {
                Outcome::Ok
            }
        })
        .unwrap();
        assert!(res.halted);
        assert_eq!(res.outcomes.len(), 1);
        assert_eq!(res.failures().len(), 1);
    }

    #[test]
    fn aggregate_policy_continues_past_errors() {
        let plan = plan_of(vec![vec!["a"], vec!["b"]]);
        let cancel = Arc::new(AtomicBool::new(false));
        let res = run_groups(&plan, 1, FailurePolicy::Aggregate, true, &cancel, |r| {
            if r.name == "a" {
                Outcome::Error("boom".into())
            } else {
                Outcome::Ok
            }
        })
        .unwrap();
        assert!(!res.halted);
        assert_eq!(res.outcomes.len(), 2);
        assert_eq!(res.failures().len(), 1);
    }

    #[test]
    fn fatal_stops_even_when_aggregating() {
        let plan = plan_of(vec![vec!["a"], vec!["b"]]);
        let cancel = Arc::new(AtomicBool::new(false));
        let res = run_groups(&plan, 1, FailurePolicy::Aggregate, true, &cancel, |_| {
            Outcome::Fatal("dead".into())
        })
        .unwrap();
        assert!(res.halted);
        assert_eq!(res.outcomes.len(), 1);
    }

    #[test]
    fn peers_in_a_group_finish_despite_errors() {
        let plan = plan_of(vec![vec!["a", "b", "c"]]);
        let cancel = Arc::new(AtomicBool::new(false));
        let res = run_groups(&plan, 2, FailurePolicy::HaltOnError, true, &cancel, |r| {
            if r.name == "b" {
                Outcome::Error("boom".into())
            } else {
                Outcome::Ok
            }
        })
        .unwrap();
        // all three reached a terminal outcome before the run stopped
        assert_eq!(res.outcomes.len(), 3);
        assert!(res.halted);
    }

    #[test]
    fn changed_outcomes_are_collected() {
        let plan = plan_of(vec![vec!["a", "b"]]);
        let cancel = Arc::new(AtomicBool::new(false));
        let res = run_groups(&plan, 1, FailurePolicy::Aggregate, true, &cancel, |r| {
            if r.name == "a" {
                Outcome::Changed
            } else {
                Outcome::Ok
            }
        })
        .unwrap();
        assert_eq!(res.changed().len(), 1);
        assert!(res.ok());
    }
}
