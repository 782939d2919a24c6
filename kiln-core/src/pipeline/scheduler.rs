// kiln-core/src/pipeline/scheduler.rs
//! Bookkeeping for a run: which formulas may start, which finished, which were given up on.

use std::collections::{HashMap, HashSet, VecDeque};

use kiln_common::dependency::BuildPlan;
use kiln_common::error::{KilnError, Result};
use kiln_common::pipeline::FormulaStatus;
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobState {
    Waiting,
    Dispatched,
    Done,
    Failed(String),
    Skipped { failed_dependency: String },
}

impl JobState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobState::Done | JobState::Failed(_) | JobState::Skipped { .. }
        )
    }

    fn label(&self) -> &'static str {
        match self {
            JobState::Waiting => "Waiting",
            JobState::Dispatched => "Dispatched",
            JobState::Done => "Done",
            JobState::Failed(_) => "Failed",
            JobState::Skipped { .. } => "Skipped",
        }
    }
}

/// Per-formula state of a plan.
#[derive(Debug)]
pub struct JobBoard {
    order: Vec<String>,
    predecessors: HashMap<String, Vec<String>>,
    dependents: HashMap<String, Vec<String>>,
    states: HashMap<String, JobState>,
}

impl JobBoard {
    pub fn new(plan: &BuildPlan) -> Self {
        let order: Vec<String> = plan.iter().map(|e| e.name().to_string()).collect();
        let mut predecessors = HashMap::new();
        let mut dependents: HashMap<String, Vec<String>> = HashMap::new();
        for entry in plan.iter() {
            for dep in &entry.dependencies {
                dependents
                    .entry(dep.clone())
                    .or_default()
                    .push(entry.name().to_string());
            }
            predecessors.insert(entry.name().to_string(), entry.dependencies.clone());
        }
        let states = order
            .iter()
            .map(|name| (name.clone(), JobState::Waiting))
            .collect();
        Self {
            order,
            predecessors,
            dependents,
            states,
        }
    }

    pub fn state(&self, name: &str) -> Option<&JobState> {
        self.states.get(name)
    }

    /// Waiting formulas whose predecessors are all `Done`, in plan order.
    pub fn ready(&self) -> Vec<String> {
        self.order
            .iter()
            .filter(|name| self.states.get(*name) == Some(&JobState::Waiting))
            .filter(|name| {
                self.predecessors.get(*name).map_or(true, |deps| {
                    deps.iter()
                        .all(|dep| self.states.get(dep) == Some(&JobState::Done))
                })
            })
            .cloned()
            .collect()
    }

    pub fn mark_dispatched(&mut self, name: &str) -> Result<()> {
        self.transition(name, JobState::Dispatched, |s| *s == JobState::Waiting)
    }

    pub fn mark_done(&mut self, name: &str) -> Result<()> {
        self.transition(name, JobState::Done, |s| *s == JobState::Dispatched)
    }

    /// Marks `name` failed and every formula that transitively depends on it and has not
    /// started yet as skipped. Returns the newly skipped formulas in plan order.
    pub fn mark_failed(&mut self, name: &str, reason: impl Into<String>) -> Result<Vec<String>> {
        self.transition(name, JobState::Failed(reason.into()), |s| !s.is_terminal())?;

        let mut queue = VecDeque::from([name.to_string()]);
        let mut seen = HashSet::new();
        let mut skipped = HashSet::new();
        while let Some(current) = queue.pop_front() {
            let Some(dependents) = self.dependents.get(&current) else {
                continue;
            };
            for dependent in dependents {
                if !seen.insert(dependent.clone()) {
                    continue;
                }
                if let Some(state) = self.states.get_mut(dependent) {
                    if *state == JobState::Waiting {
                        debug!("[{}] skipped, '{}' failed", dependent, name);
                        *state = JobState::Skipped {
                            failed_dependency: name.to_string(),
                        };
                        skipped.insert(dependent.clone());
                    }
                }
                queue.push_back(dependent.clone());
            }
        }
        Ok(self
            .order
            .iter()
            .filter(|n| skipped.contains(*n))
            .cloned()
            .collect())
    }

    /// Formulas currently handed to a worker.
    pub fn in_flight(&self) -> usize {
        self.states
            .values()
            .filter(|s| **s == JobState::Dispatched)
            .count()
    }

    pub fn is_finished(&self) -> bool {
        self.states.values().all(JobState::is_terminal)
    }

    /// Fails whatever is still waiting. Only reachable when nothing is running and nothing is
    /// ready, which a valid plan never produces.
    pub fn fail_stranded(&mut self) -> Vec<String> {
        let stranded: Vec<String> = self
            .order
            .iter()
            .filter(|name| self.states.get(*name) == Some(&JobState::Waiting))
            .cloned()
            .collect();
        for name in &stranded {
            self.states.insert(
                name.clone(),
                JobState::Failed("predecessors can never complete".to_string()),
            );
        }
        stranded
    }

    /// Final statuses in plan order. Formulas that never reached a terminal state count as
    /// failed.
    pub fn statuses(&self) -> Vec<(String, FormulaStatus)> {
        self.order
            .iter()
            .map(|name| {
                let status = match self.states.get(name) {
                    Some(JobState::Done) => FormulaStatus::Done,
                    Some(JobState::Skipped { failed_dependency }) => FormulaStatus::Skipped {
                        failed_dependency: failed_dependency.clone(),
                    },
                    Some(JobState::Failed(reason)) => FormulaStatus::Failed {
                        reason: reason.clone(),
                    },
                    Some(other) => FormulaStatus::Failed {
                        reason: format!("run ended while {}", other.label()),
                    },
                    None => FormulaStatus::Failed {
                        reason: "unknown formula".to_string(),
                    },
                };
                (name.clone(), status)
            })
            .collect()
    }

    fn transition(
        &mut self,
        name: &str,
        next: JobState,
        allowed: impl Fn(&JobState) -> bool,
    ) -> Result<()> {
        let state = self
            .states
            .get_mut(name)
            .ok_or_else(|| KilnError::NotFound(format!("'{name}' is not part of the plan")))?;
        if !allowed(state) {
            return Err(KilnError::InvalidTransition {
                from: format!("{name}: {}", state.label()),
                to: next.label().to_string(),
            });
        }
        *state = next;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;
    use std::sync::Arc;

    use kiln_common::dependency::PlanEntry;
    use kiln_common::model::formula::FormulaSpec;

    use super::*;

    fn entry(name: &str, deps: &[&str]) -> PlanEntry {
        let spec: FormulaSpec = serde_json::from_value(serde_json::json!({
            "name": name,
            "version": "1.0",
            "sources": [{
                "url": format!("https://example.org/{name}.tar.gz"),
                "sha256": "0e23756c05c97596009f6a2d8d1625ed34fe556a44067413089d4ca321a0c4d7"
            }]
        }))
        .unwrap();
        PlanEntry {
            formula: Arc::new(spec),
            build_dir: PathBuf::from("/tmp").join(name),
            dependencies: deps.iter().map(|d| d.to_string()).collect(),
        }
    }

    // zlib <- libffi <- python <- opencilk, cmake <- opencilk, ninja independent
    fn plan() -> BuildPlan {
        BuildPlan {
            entries: vec![
                entry("cmake", &[]),
                entry("ninja", &[]),
                entry("zlib", &[]),
                entry("libffi", &["zlib"]),
                entry("python", &["libffi"]),
                entry("opencilk", &["cmake", "python"]),
            ],
        }
    }

    #[test]
    fn only_formulas_with_finished_predecessors_are_ready() {
        let mut board = JobBoard::new(&plan());
        assert_eq!(board.ready(), ["cmake", "ninja", "zlib"]);
        for name in ["cmake", "ninja", "zlib"] {
            board.mark_dispatched(name).unwrap();
        }
        assert!(board.ready().is_empty());
        assert_eq!(board.in_flight(), 3);

        board.mark_done("zlib").unwrap();
        assert_eq!(board.ready(), ["libffi"]);
        board.mark_done("cmake").unwrap();
        assert_eq!(board.ready(), ["libffi"]);
    }

    #[test]
    fn failure_skips_transitive_dependents_only() {
        let mut board = JobBoard::new(&plan());
        board.mark_dispatched("zlib").unwrap();
        board.mark_dispatched("cmake").unwrap();
        let skipped = board.mark_failed("zlib", "Building stage failed").unwrap();
        assert_eq!(skipped, ["libffi", "python", "opencilk"]);
        assert_eq!(
            board.state("opencilk"),
            Some(&JobState::Skipped {
                failed_dependency: "zlib".into()
            })
        );
        assert_eq!(board.state("cmake"), Some(&JobState::Dispatched));
        assert_eq!(board.ready(), ["ninja"]);

        board.mark_done("cmake").unwrap();
        board.mark_dispatched("ninja").unwrap();
        board.mark_done("ninja").unwrap();
        assert!(board.is_finished());

        let statuses = board.statuses();
        assert_eq!(statuses[0], ("cmake".to_string(), FormulaStatus::Done));
        assert!(matches!(statuses[2].1, FormulaStatus::Failed { .. }));
    }

    #[test]
    fn illegal_transitions_are_rejected() {
        let mut board = JobBoard::new(&plan());
        assert!(matches!(
            board.mark_done("cmake"),
            Err(KilnError::InvalidTransition { .. })
        ));
        assert!(matches!(board.mark_dispatched("nope"), Err(KilnError::NotFound(_))));
        board.mark_dispatched("cmake").unwrap();
        board.mark_done("cmake").unwrap();
        assert!(board.mark_failed("cmake", "late").is_err());
    }

    #[test]
    fn stranded_formulas_fail() {
        let broken = BuildPlan {
            entries: vec![entry("a", &["missing"])],
        };
        let mut board = JobBoard::new(&broken);
        assert!(board.ready().is_empty());
        assert_eq!(board.fail_stranded(), ["a"]);
        assert!(board.is_finished());
    }
}
