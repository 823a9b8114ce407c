//! Execution strategies: async iterators over a workflow's actions that
//! respect dependency and failure-propagation policy.
//!
//! Each strategy's `next()` yields the action the orchestrator may start
//! right now, or `None` once nothing more can run. `loose`/`strict` wait on
//! active actions' completion signals via `select_all` rather than polling.

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;

use async_trait::async_trait;
use indexmap::IndexMap;
use tokio::sync::watch;

use crate::action::{Action, ActionStatus};
use crate::workflow::Workflow;

#[async_trait]
pub trait Strategy: Send {
    /// The next action to start, or `None` when the strategy is exhausted.
    async fn next(&mut self) -> Option<Arc<Action>>;
}

/// Builds a strategy by its configured name (§4.6 `strategy_name`).
pub fn build(name: &str, workflow: Arc<Workflow>) -> Result<Box<dyn Strategy>, String> {
    match name {
        "free" => Ok(Box::new(FreeStrategy::new(&workflow))),
        "sequential" => Ok(Box::new(SequentialStrategy::new(&workflow))),
        "strict-sequential" => Ok(Box::new(StrictSequentialStrategy::new(&workflow))),
        "loose" => Ok(Box::new(LooseStrategy::new(workflow, false))),
        "strict" => Ok(Box::new(LooseStrategy::new(workflow, true))),
        other => Err(format!("Unrecognized strategy: {other:?}")),
    }
}

pub struct FreeStrategy {
    pending: VecDeque<Arc<Action>>,
}

impl FreeStrategy {
    pub fn new(workflow: &Workflow) -> Self {
        Self { pending: workflow.actions.values().cloned().collect() }
    }
}

#[async_trait]
impl Strategy for FreeStrategy {
    async fn next(&mut self) -> Option<Arc<Action>> {
        self.pending.pop_front()
    }
}

pub struct SequentialStrategy {
    pending: VecDeque<Arc<Action>>,
    current: Option<Arc<Action>>,
}

impl SequentialStrategy {
    pub fn new(workflow: &Workflow) -> Self {
        Self { pending: workflow.actions.values().cloned().collect(), current: None }
    }
}

#[async_trait]
impl Strategy for SequentialStrategy {
    async fn next(&mut self) -> Option<Arc<Action>> {
        if let Some(previous) = self.current.take() {
            let _ = previous.await_completion().await;
        }
        let next = self.pending.pop_front()?;
        self.current = Some(next.clone());
        Some(next)
    }
}

pub struct StrictSequentialStrategy {
    pending: VecDeque<Arc<Action>>,
    current: Option<Arc<Action>>,
    aborted: bool,
}

impl StrictSequentialStrategy {
    pub fn new(workflow: &Workflow) -> Self {
        Self { pending: workflow.actions.values().cloned().collect(), current: None, aborted: false }
    }
}

#[async_trait]
impl Strategy for StrictSequentialStrategy {
    async fn next(&mut self) -> Option<Arc<Action>> {
        if let Some(previous) = self.current.take() {
            if previous.await_completion().await.is_err() {
                self.aborted = true;
            }
        }
        if self.aborted {
            while let Some(action) = self.pending.pop_front() {
                action.force_skip().await;
            }
            return None;
        }
        let next = self.pending.pop_front()?;
        self.current = Some(next.clone());
        Some(next)
    }
}

/// `loose` (and, with `strict_all = true`, `strict`): emits an action once
/// every ancestor is done, skipping it instead if a strict-escalated
/// ancestor ended in a non-success terminal status.
pub struct LooseStrategy {
    workflow: Arc<Workflow>,
    strict_all: bool,
    pending: Vec<String>,
    blockers: IndexMap<String, HashSet<String>>,
    active: Vec<(String, watch::Receiver<bool>)>,
}

impl LooseStrategy {
    pub fn new(workflow: Arc<Workflow>, strict_all: bool) -> Self {
        let pending: Vec<String> = workflow.actions.keys().cloned().collect();
        let blockers = pending
            .iter()
            .map(|name| {
                let ancestors = workflow.ancestors_of(name).cloned().unwrap_or_default();
                (name.clone(), ancestors.keys().cloned().collect::<HashSet<_>>())
            })
            .collect();
        Self { workflow, strict_all, pending, blockers, active: Vec::new() }
    }

    async fn find_ready(&self) -> Option<usize> {
        for (i, name) in self.pending.iter().enumerate() {
            let mut all_done = true;
            for blocker in &self.blockers[name] {
                let done = match self.workflow.actions.get(blocker) {
                    Some(action) => action.done().await,
                    None => true,
                };
                if !done {
                    all_done = false;
                    break;
                }
            }
            if all_done {
                return Some(i);
            }
        }
        None
    }

    async fn should_skip(&self, name: &str) -> bool {
        let Some(ancestors) = self.workflow.ancestors_of(name) else {
            return false;
        };
        for (ancestor_name, dep) in ancestors {
            if let Some(ancestor) = self.workflow.actions.get(ancestor_name) {
                let status = ancestor.status().await;
                let failed_like =
                    matches!(status, ActionStatus::Failure | ActionStatus::Warning | ActionStatus::Skipped);
                if failed_like && (dep.strict || self.strict_all) {
                    return true;
                }
            }
        }
        false
    }

    async fn wait_any_active(&mut self) {
        if let Some(pos) = self.active.iter().position(|(_, rx)| *rx.borrow()) {
            self.active.remove(pos);
            return;
        }
        if self.active.is_empty() {
            return;
        }
        let futs: Vec<_> = self.active.iter_mut().map(|(_, rx)| Box::pin(rx.changed())).collect();
        let (_result, idx, rest) = futures::future::select_all(futs).await;
        drop(rest);
        self.active.remove(idx);
    }
}

#[async_trait]
impl Strategy for LooseStrategy {
    async fn next(&mut self) -> Option<Arc<Action>> {
        loop {
            match self.find_ready().await {
                Some(i) => {
                    let name = self.pending.remove(i);
                    self.blockers.shift_remove(&name);
                    let action = self.workflow.actions[&name].clone();

                    if self.should_skip(&name).await {
                        action.force_skip().await;
                        continue;
                    }

                    self.active.push((name, action.subscribe_completion()));
                    return Some(action);
                }
                None => {
                    if self.active.is_empty() {
                        return None;
                    }
                    self.wait_any_active().await;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action::{ActionBody, ActionHandle, BodyOutcome, Dependency, Severity};

    struct Immediate;
    #[async_trait]
    impl ActionBody for Immediate {
        async fn run(&self, _handle: &ActionHandle) -> Result<(), BodyOutcome> {
            Ok(())
        }
    }

    struct AlwaysFails;
    #[async_trait]
    impl ActionBody for AlwaysFails {
        async fn run(&self, handle: &ActionHandle) -> Result<(), BodyOutcome> {
            Err(handle.fail("boom"))
        }
    }

    fn make(name: &str, ancestors: IndexMap<String, Dependency>, fails: bool) -> Arc<Action> {
        let body: Box<dyn ActionBody> = if fails { Box::new(AlwaysFails) } else { Box::new(Immediate) };
        Arc::new(Action::new(name, None, Severity::Normal, true, ancestors, body))
    }

    #[tokio::test]
    async fn loose_emits_dependent_only_after_ancestor_done() {
        let mut actions = IndexMap::new();
        actions.insert("a".into(), make("a", IndexMap::new(), false));
        let mut b_anc = IndexMap::new();
        b_anc.insert("a".to_string(), Dependency { strict: false, external: false });
        actions.insert("b".into(), make("b", b_anc, false));
        let workflow = Arc::new(Workflow::new(actions, IndexMap::new()).unwrap());

        let mut strategy = LooseStrategy::new(workflow.clone(), false);
        let first = strategy.next().await.unwrap();
        assert_eq!(first.name, "a");
        first.execute().await;
        let second = strategy.next().await.unwrap();
        assert_eq!(second.name, "b");
        second.execute().await;
        assert!(strategy.next().await.is_none());
    }

    #[tokio::test]
    async fn strict_chain_failure_skips_descendants() {
        let mut actions = IndexMap::new();
        actions.insert("foo".into(), make("foo", IndexMap::new(), true));
        let mut bar_anc = IndexMap::new();
        bar_anc.insert("foo".to_string(), Dependency { strict: true, external: false });
        actions.insert("bar".into(), make("bar", bar_anc, false));
        let mut baz_anc = IndexMap::new();
        baz_anc.insert("bar".to_string(), Dependency { strict: true, external: false });
        actions.insert("baz".into(), make("baz", baz_anc, false));
        let workflow = Arc::new(Workflow::new(actions, IndexMap::new()).unwrap());

        let mut strategy = LooseStrategy::new(workflow.clone(), false);
        let foo = strategy.next().await.unwrap();
        foo.execute().await;
        assert_eq!(foo.status().await, ActionStatus::Failure);

        assert!(strategy.next().await.is_none());
        assert_eq!(workflow.actions["bar"].status().await, ActionStatus::Skipped);
        assert_eq!(workflow.actions["baz"].status().await, ActionStatus::Skipped);
    }

    #[tokio::test]
    async fn strict_sequential_skips_remaining_after_failure() {
        let mut actions = IndexMap::new();
        actions.insert("foo".into(), make("foo", IndexMap::new(), true));
        actions.insert("bar".into(), make("bar", IndexMap::new(), false));
        let workflow = Workflow::new(actions, IndexMap::new()).unwrap();

        let mut strategy = StrictSequentialStrategy::new(&workflow);
        let foo = strategy.next().await.unwrap();
        foo.execute().await;
        assert!(strategy.next().await.is_none());
        assert_eq!(workflow.actions["bar"].status().await, ActionStatus::Skipped);
    }
}
