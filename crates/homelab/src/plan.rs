//! Provisioning plan.
//!
//! A [`Plan`] is a static dependency graph over [`Step`]s. The ordering rules
//! live here as edges; [`execute`] runs every step as soon as everything it
//! depends on has finished.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::fmt;
use std::future::Future;

use anyhow::{anyhow, Context, Result};
use thiserror::Error;
use tokio::task::JoinSet;
use tracing::{debug, info};

use crate::nodes::NodeTable;

/// One unit of provisioning work.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Step {
    /// Make the installer ISO available on the hypervisor.
    DownloadIso,
    /// Create (or adopt) a node's VM and wait for its address.
    CreateVm(String),
    /// Push a node's machine config.
    ApplyConfig(String),
    /// Bootstrap etcd on the first control-plane node.
    Bootstrap,
    /// Retrieve the admin kubeconfig.
    Kubeconfig,
}

impl Step {
    /// Node this step acts on, if any.
    #[must_use]
    pub fn node(&self) -> Option<&str> {
        match self {
            Self::CreateVm(name) | Self::ApplyConfig(name) => Some(name),
            _ => None,
        }
    }
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::DownloadIso => write!(f, "download-iso"),
            Self::CreateVm(name) => write!(f, "create-vm[{name}]"),
            Self::ApplyConfig(name) => write!(f, "apply-config[{name}]"),
            Self::Bootstrap => write!(f, "bootstrap"),
            Self::Kubeconfig => write!(f, "kubeconfig"),
        }
    }
}

/// Errors building a plan.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum PlanError {
    #[error("step {0} added twice")]
    DuplicateStep(Step),

    #[error("step {step} depends on unknown step {dependency}")]
    UnknownDependency { step: Step, dependency: Step },

    #[error("dependency cycle through {0}")]
    Cycle(Step),
}

/// A validated, acyclic set of steps and their dependencies.
#[derive(Debug, Clone, Default)]
pub struct Plan {
    /// Steps in insertion order.
    steps: Vec<Step>,
    /// Direct dependencies of each step.
    deps: BTreeMap<Step, Vec<Step>>,
}

impl Plan {
    /// Build a plan from explicit edges.
    ///
    /// # Errors
    /// Returns an error on duplicate steps, unknown dependencies or cycles.
    pub fn from_edges(edges: Vec<(Step, Vec<Step>)>) -> Result<Self, PlanError> {
        let mut plan = Self::default();
        for (step, deps) in edges {
            if plan.deps.contains_key(&step) {
                return Err(PlanError::DuplicateStep(step));
            }
            plan.steps.push(step.clone());
            plan.deps.insert(step, deps);
        }

        for step in &plan.steps {
            for dependency in &plan.deps[step] {
                if !plan.deps.contains_key(dependency) {
                    return Err(PlanError::UnknownDependency {
                        step: step.clone(),
                        dependency: dependency.clone(),
                    });
                }
            }
        }

        plan.topological_order()?;
        Ok(plan)
    }

    /// The cluster bring-up plan for `nodes`.
    ///
    /// Every worker apply waits for every control-plane apply, bootstrap
    /// waits for the first control-plane apply and the kubeconfig waits for
    /// bootstrap.
    ///
    /// # Errors
    /// Returns an error if two nodes share a name.
    pub fn build(nodes: &NodeTable) -> Result<Self, PlanError> {
        let cp_applies: Vec<Step> = nodes
            .control_plane
            .iter()
            .map(|n| Step::ApplyConfig(n.name.clone()))
            .collect();

        let mut edges = vec![(Step::DownloadIso, vec![])];

        for node in nodes.all() {
            edges.push((Step::CreateVm(node.name.clone()), vec![Step::DownloadIso]));
        }
        for node in &nodes.control_plane {
            edges.push((
                Step::ApplyConfig(node.name.clone()),
                vec![Step::CreateVm(node.name.clone())],
            ));
        }
        for node in &nodes.workers {
            let mut deps = vec![Step::CreateVm(node.name.clone())];
            deps.extend(cp_applies.iter().cloned());
            edges.push((Step::ApplyConfig(node.name.clone()), deps));
        }

        edges.push((
            Step::Bootstrap,
            vec![Step::ApplyConfig(nodes.first_control_plane().name.clone())],
        ));
        edges.push((Step::Kubeconfig, vec![Step::Bootstrap]));

        Self::from_edges(edges)
    }

    /// All steps in insertion order.
    #[must_use]
    pub fn steps(&self) -> &[Step] {
        &self.steps
    }

    /// Number of steps.
    #[must_use]
    pub fn len(&self) -> usize {
        self.steps.len()
    }

    /// Whether the plan has no steps.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Number of steps matching `predicate`.
    pub fn count(&self, predicate: impl Fn(&Step) -> bool) -> usize {
        self.steps.iter().filter(|s| predicate(s)).count()
    }

    /// Direct dependencies of `step`.
    #[must_use]
    pub fn dependencies(&self, step: &Step) -> &[Step] {
        self.deps.get(step).map_or(&[], Vec::as_slice)
    }

    /// Whether `from` depends on `to`, directly or transitively.
    #[must_use]
    pub fn has_path(&self, from: &Step, to: &Step) -> bool {
        let mut seen = BTreeSet::new();
        let mut stack = vec![from];
        while let Some(step) = stack.pop() {
            for dep in self.dependencies(step) {
                if dep == to {
                    return true;
                }
                if seen.insert(dep) {
                    stack.push(dep);
                }
            }
        }
        false
    }

    /// Steps ordered so that every step comes after its dependencies.
    ///
    /// Ties keep insertion order.
    ///
    /// # Errors
    /// Returns [`PlanError::Cycle`] if the graph is not acyclic.
    pub fn topological_order(&self) -> Result<Vec<Step>, PlanError> {
        let mut pending: BTreeMap<&Step, usize> = self
            .steps
            .iter()
            .map(|s| (s, self.dependencies(s).len()))
            .collect();
        let dependents = self.dependents();

        let mut ready: VecDeque<&Step> = self
            .steps
            .iter()
            .filter(|s| pending[s] == 0)
            .collect();
        let mut order = Vec::with_capacity(self.steps.len());

        while let Some(step) = ready.pop_front() {
            order.push(step.clone());
            for dependent in dependents.get(step).into_iter().flatten() {
                if let Some(count) = pending.get_mut(dependent) {
                    *count -= 1;
                    if *count == 0 {
                        ready.push_back(*dependent);
                    }
                }
            }
        }

        if order.len() == self.steps.len() {
            Ok(order)
        } else {
            let stuck = self
                .steps
                .iter()
                .find(|s| pending[s] > 0)
                .cloned()
                .unwrap_or(Step::DownloadIso);
            Err(PlanError::Cycle(stuck))
        }
    }

    /// Reverse edges, in insertion order.
    fn dependents(&self) -> BTreeMap<&Step, Vec<&Step>> {
        let mut dependents: BTreeMap<&Step, Vec<&Step>> = BTreeMap::new();
        for step in &self.steps {
            for dep in self.dependencies(step) {
                dependents.entry(dep).or_default().push(step);
            }
        }
        dependents
    }
}

/// Run every step of `plan`, each as soon as its dependencies have finished.
///
/// Independent steps run concurrently. The first failure aborts every step
/// still in flight and is returned.
///
/// # Errors
/// Returns the first step error, or an error if a step panicked.
pub async fn execute<F, Fut>(plan: &Plan, runner: F) -> Result<()>
where
    F: Fn(Step) -> Fut,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    let dependents = plan.dependents();
    let mut pending: BTreeMap<&Step, usize> = plan
        .steps
        .iter()
        .map(|s| (s, plan.dependencies(s).len()))
        .collect();

    let mut tasks = JoinSet::new();
    let spawn = |tasks: &mut JoinSet<(Step, Result<()>)>, step: &Step| {
        debug!(step = %step, "Starting step");
        let step = step.clone();
        let fut = runner(step.clone());
        tasks.spawn(async move { (step, fut.await) });
    };

    for step in plan.steps.iter().filter(|s| pending[s] == 0) {
        spawn(&mut tasks, step);
    }

    let mut completed = 0;
    // Returning early drops the set, which aborts every in-flight step.
    while let Some(joined) = tasks.join_next().await {
        let (step, result) = joined.map_err(|e| anyhow!("Step task failed: {e}"))?;
        result.with_context(|| format!("Step {step} failed"))?;

        completed += 1;
        info!(step = %step, completed, total = plan.len(), "Step complete");

        for dependent in dependents.get(&step).into_iter().flatten() {
            if let Some(count) = pending.get_mut(*dependent) {
                *count -= 1;
                if *count == 0 {
                    spawn(&mut tasks, *dependent);
                }
            }
        }
    }

    if completed == plan.len() {
        Ok(())
    } else {
        Err(anyhow!(
            "Plan stalled after {completed} of {} steps",
            plan.len()
        ))
    }
}
