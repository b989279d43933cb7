// tests/scheduler_properties.rs

mod common;
use crate::common::builders::{DefinitionBuilder, JobBuilder, StepBuilder};
use crate::common::{push_trigger, scheduler_for};

use std::collections::{BTreeMap, HashSet, VecDeque};

use proptest::prelude::*;
use pipewright::config::PipelineDefinition;
use pipewright::dag::{NodeState, Scheduler, SchedulerStep};
use pipewright::types::StepStatus;

// Strategy to generate a valid multi-job definition.
// We ensure acyclicity by only allowing job N to need jobs 0..N-1.
fn definition_strategy(max_jobs: usize) -> impl Strategy<Value = (PipelineDefinition, usize)> {
    (1..=max_jobs, 1..=4usize, any::<bool>()).prop_flat_map(|(num_jobs, concurrency, fail_fast)| {
        let needs_strat = proptest::collection::vec(
            proptest::collection::vec(any::<usize>(), 0..3),
            num_jobs,
        );
        let steps_strat = proptest::collection::vec(1..=2usize, num_jobs);

        (needs_strat, steps_strat).prop_map(move |(raw_needs, steps)| {
            let mut builder = DefinitionBuilder::new("prop")
                .concurrency(concurrency)
                .fail_fast(fail_fast);
            for (i, potential) in raw_needs.into_iter().enumerate() {
                let mut job = JobBuilder::new(&format!("job{i}"));

                // Sanitize dependencies: only allow needs < i
                let mut needs = HashSet::new();
                for n in potential {
                    if i > 0 {
                        needs.insert(n % i);
                    }
                }
                for n in needs {
                    job = job.needs(&format!("job{n}"));
                }
                for s in 0..steps[i] {
                    job = job.step(StepBuilder::run(&format!("s{s}"), "true"));
                }
                builder = builder.job(job);
            }
            (builder.build(), concurrency)
        })
    })
}

/// Drives a scheduler the way the runtime does, completing in-flight
/// steps in FIFO order, and checks the invariants after every step.
struct Simulation {
    scheduler: Scheduler,
    concurrency: usize,
    failing: HashSet<String>,
    executing: VecDeque<String>,
    cancel_requested: HashSet<String>,
    terminal: HashSet<String>,
    saw_failure: bool,
}

impl Simulation {
    fn absorb(&mut self, step: SchedulerStep) -> Result<(), TestCaseError> {
        for (node, state) in &step.settled {
            prop_assert!(state.is_terminal());
            self.terminal.insert(node.clone());
        }
        if self.saw_failure && self.scheduler.options().fail_fast {
            prop_assert!(step.dispatched.is_empty(), "dispatched after a failure under fail-fast");
        }
        for s in &step.dispatched {
            for pred in self.scheduler.graph().predecessors_of(&s.node) {
                prop_assert!(self.terminal.contains(pred), "{} dispatched before {}", s.node, pred);
            }
            self.executing.push_back(s.node.clone());
        }
        self.cancel_requested.extend(step.cancel_running);
        prop_assert!(self.executing.len() <= self.concurrency);
        prop_assert!(self.scheduler.in_flight_count() <= self.concurrency);
        Ok(())
    }

    fn run(&mut self) -> Result<(), TestCaseError> {
        let first = self.scheduler.start();
        self.absorb(first)?;

        let mut rounds = 0;
        while let Some(node) = self.executing.pop_front() {
            rounds += 1;
            prop_assert!(rounds <= 1000, "simulation did not terminate");

            let status = if self.cancel_requested.contains(&node) {
                StepStatus::Cancelled
            } else if self.failing.contains(&node) {
                StepStatus::Failed
            } else {
                StepStatus::Succeeded
            };
            self.terminal.insert(node.clone());
            let step = self.scheduler.handle_completion(&node, status, BTreeMap::new());
            if status == StepStatus::Failed {
                self.saw_failure = true;
            }
            self.absorb(step)?;
        }

        prop_assert!(self.scheduler.is_finished());
        for node in self.scheduler.graph().nodes() {
            let state = self.scheduler.state_of(&node.id).unwrap();
            prop_assert!(state.is_terminal(), "{} left in {:?}", node.id, state);
        }
        Ok(())
    }
}

proptest! {
    #[test]
    fn scheduler_terminates_and_respects_invariants(
        (def, concurrency) in definition_strategy(6),
        failing_indices in proptest::collection::vec(0..12usize, 0..3),
    ) {
        let scheduler = scheduler_for(&def, &push_trigger());
        let ids: Vec<String> = scheduler.graph().nodes().iter().map(|n| n.id.clone()).collect();
        let failing: HashSet<String> = failing_indices
            .into_iter()
            .filter(|&i| i < ids.len())
            .map(|i| ids[i].clone())
            .collect();

        let mut sim = Simulation {
            scheduler,
            concurrency,
            failing: failing.clone(),
            executing: VecDeque::new(),
            cancel_requested: HashSet::new(),
            terminal: HashSet::new(),
            saw_failure: false,
        };
        sim.run()?;

        let any_failed = sim
            .scheduler
            .graph()
            .nodes()
            .iter()
            .any(|n| sim.scheduler.state_of(&n.id) == Some(NodeState::Failed));
        if any_failed {
            prop_assert_eq!(sim.scheduler.outcome(), pipewright::types::RunStatus::Failed);
        } else if failing.is_empty() {
            prop_assert_eq!(sim.scheduler.outcome(), pipewright::types::RunStatus::Succeeded);
        }
    }
}
