//! The workflow graph: integrity checks, descendants, and tier ordering.
//!
//! Built once from the already-loaded action map and context; everything
//! here is immutable afterwards. Strategies consult [`Workflow::ancestors_of`]
//! rather than an action's own `ancestors` field, since this is where
//! missing `external` ancestors have already been pruned away.

use std::sync::Arc;

use indexmap::IndexMap;

use crate::action::{Action, Dependency};
use crate::errors::IntegrityError;
use crate::rendering::DocValue;

pub struct Workflow {
    pub actions: IndexMap<String, Arc<Action>>,
    pub context: IndexMap<String, DocValue>,
    ancestors: IndexMap<String, IndexMap<String, Dependency>>,
    descendants: IndexMap<String, Vec<String>>,
    entrypoints: Vec<String>,
    tiers: Vec<Vec<String>>,
}

impl Workflow {
    pub fn new(
        actions: IndexMap<String, Arc<Action>>,
        context: IndexMap<String, DocValue>,
    ) -> Result<Self, IntegrityError> {
        let mut ancestors = IndexMap::new();
        let mut missing = Vec::new();
        for (name, action) in &actions {
            let mut pruned = IndexMap::new();
            for (ancestor_name, dep) in &action.ancestors {
                if actions.contains_key(ancestor_name) {
                    pruned.insert(ancestor_name.clone(), *dep);
                } else if !dep.external {
                    missing.push(format!("{name} -> {ancestor_name}"));
                }
            }
            ancestors.insert(name.clone(), pruned);
        }
        if !missing.is_empty() {
            return Err(IntegrityError(format!("Missing ancestors: {}", missing.join(", "))));
        }

        let mut descendants: IndexMap<String, Vec<String>> =
            actions.keys().map(|n| (n.clone(), Vec::new())).collect();
        for (name, deps) in &ancestors {
            for ancestor_name in deps.keys() {
                descendants
                    .get_mut(ancestor_name)
                    .expect("ancestor present in action map")
                    .push(name.clone());
            }
        }

        let entrypoints: Vec<String> =
            actions.keys().filter(|name| ancestors[*name].is_empty()).cloned().collect();
        if entrypoints.is_empty() {
            return Err(IntegrityError("No entrypoints".into()));
        }

        let mut tier_of: IndexMap<String, usize> = IndexMap::new();
        for name in &entrypoints {
            tier_of.insert(name.clone(), 0);
        }
        let mut tier_count = 1usize;
        let mut frontier = entrypoints.clone();
        let mut depth = 0usize;
        while !frontier.is_empty() {
            let mut next = Vec::new();
            for name in &frontier {
                for descendant in &descendants[name] {
                    if !tier_of.contains_key(descendant) {
                        tier_of.insert(descendant.clone(), depth + 1);
                        next.push(descendant.clone());
                    }
                }
            }
            if !next.is_empty() {
                tier_count = tier_count.max(depth + 2);
            }
            frontier = next;
            depth += 1;
        }

        if tier_of.len() != actions.len() {
            let unreached: Vec<_> = actions.keys().filter(|n| !tier_of.contains_key(*n)).cloned().collect();
            return Err(IntegrityError(format!("Unreachable actions: {}", unreached.join(", "))));
        }

        let mut tiers: Vec<Vec<String>> = vec![Vec::new(); tier_count];
        for name in actions.keys() {
            tiers[tier_of[name]].push(name.clone());
        }

        Ok(Self { actions, context, ancestors, descendants, entrypoints, tiers })
    }

    pub fn ancestors_of(&self, name: &str) -> Option<&IndexMap<String, Dependency>> {
        self.ancestors.get(name)
    }

    pub fn descendants_of(&self, name: &str) -> Option<&[String]> {
        self.descendants.get(name).map(Vec::as_slice)
    }

    pub fn entrypoints(&self) -> &[String] {
        &self.entrypoints
    }

    pub fn tier_of(&self, name: &str) -> Option<usize> {
        self.tiers.iter().position(|tier| tier.iter().any(|n| n == name))
    }

    /// Actions in `(tier_index, insertion-order-within-tier)` order.
    pub fn iter_by_tier(&self) -> impl Iterator<Item = (usize, &Arc<Action>)> {
        self.tiers.iter().enumerate().flat_map(move |(tier, names)| {
            names.iter().map(move |name| (tier, &self.actions[name]))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action::{Action, ActionBody, ActionHandle, BodyOutcome, Severity};
    use async_trait::async_trait;

    struct Noop;

    #[async_trait]
    impl ActionBody for Noop {
        async fn run(&self, _handle: &ActionHandle) -> Result<(), BodyOutcome> {
            Ok(())
        }
    }

    fn action(name: &str, ancestors: IndexMap<String, Dependency>) -> Arc<Action> {
        Arc::new(Action::new(name, None, Severity::Normal, true, ancestors, Box::new(Noop)))
    }

    #[test]
    fn linear_chain_gets_sequential_tiers() {
        let mut actions = IndexMap::new();
        actions.insert("a".into(), action("a", IndexMap::new()));
        let mut b_anc = IndexMap::new();
        b_anc.insert("a".to_string(), Dependency { strict: true, external: false });
        actions.insert("b".into(), action("b", b_anc));

        let workflow = Workflow::new(actions, IndexMap::new()).unwrap();
        assert_eq!(workflow.entrypoints(), &["a".to_string()]);
        assert_eq!(workflow.tier_of("a"), Some(0));
        assert_eq!(workflow.tier_of("b"), Some(1));
    }

    #[test]
    fn missing_non_external_ancestor_is_integrity_error() {
        let mut actions = IndexMap::new();
        let mut anc = IndexMap::new();
        anc.insert("ghost".to_string(), Dependency { strict: false, external: false });
        actions.insert("a".into(), action("a", anc));
        assert!(Workflow::new(actions, IndexMap::new()).is_err());
    }

    #[test]
    fn missing_external_ancestor_is_pruned() {
        let mut actions = IndexMap::new();
        let mut anc = IndexMap::new();
        anc.insert("ghost".to_string(), Dependency { strict: false, external: true });
        actions.insert("a".into(), action("a", anc));
        let workflow = Workflow::new(actions, IndexMap::new()).unwrap();
        assert!(workflow.ancestors_of("a").unwrap().is_empty());
        assert_eq!(workflow.entrypoints(), &["a".to_string()]);
    }

    #[test]
    fn unreachable_action_is_integrity_error() {
        let mut actions = IndexMap::new();
        actions.insert("a".into(), action("a", IndexMap::new()));
        let mut b_anc = IndexMap::new();
        b_anc.insert("b".to_string(), Dependency { strict: false, external: false });
        actions.insert("b".into(), action("b", b_anc));
        assert!(Workflow::new(actions, IndexMap::new()).is_err());
    }
}
