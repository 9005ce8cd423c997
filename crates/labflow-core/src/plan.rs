//! Plan generators: `expand(process group) → ordered actions`.
//!
//! The orchestrator treats a plan as opaque. [`PlanLibrary`] maps plan names to
//! generators and numbers the expanded actions `0.0, 1.0, 2.0, …`.

use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::error::{OrchError, Result};
use crate::model::{Action, ProcessGroup, SequenceNumber};

pub trait PlanGenerator: Send + Sync {
    fn expand(&self, group: &ProcessGroup) -> Result<Vec<Action>>;
}

impl<F> PlanGenerator for F
where
    F: Fn(&ProcessGroup) -> Result<Vec<Action>> + Send + Sync,
{
    fn expand(&self, group: &ProcessGroup) -> Result<Vec<Action>> {
        self(group)
    }
}

#[derive(Clone, Default)]
pub struct PlanLibrary {
    plans: BTreeMap<String, Arc<dyn PlanGenerator>>,
}

impl PlanLibrary {
    pub fn new() -> Self {
        Self::default()
    }

    /// Library preloaded with the `sequence` and `repeat` plans.
    pub fn with_builtins() -> Self {
        let mut lib = Self::new();
        lib.register("sequence", sequence_plan);
        lib.register("repeat", repeat_plan);
        lib
    }

    pub fn register(&mut self, name: impl Into<String>, generator: impl PlanGenerator + 'static) {
        self.plans.insert(name.into(), Arc::new(generator));
    }

    pub fn contains(&self, name: &str) -> bool {
        self.plans.contains_key(name)
    }

    pub fn names(&self) -> Vec<String> {
        self.plans.keys().cloned().collect()
    }

    /// Expand `group` and assign sequence numbers in plan order.
    pub fn expand(&self, group: &ProcessGroup) -> Result<Vec<Action>> {
        let generator = self
            .plans
            .get(&group.plan)
            .ok_or_else(|| OrchError::UnknownPlan(group.plan.clone()))?;
        let mut actions = generator.expand(group)?;
        for (i, action) in actions.iter_mut().enumerate() {
            action.validate()?;
            action.sequence = SequenceNumber::from(i as f64);
        }
        Ok(actions)
    }
}

impl std::fmt::Debug for PlanLibrary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PlanLibrary")
            .field("plans", &self.plans.keys().collect::<Vec<_>>())
            .finish()
    }
}

fn action_from(value: &Value, what: &str) -> Result<Action> {
    serde_json::from_value(value.clone())
        .map_err(|e| OrchError::Validation(format!("{what}: {e}")))
}

/// `actions: [Action]` — dispatched verbatim, in order.
fn sequence_plan(group: &ProcessGroup) -> Result<Vec<Action>> {
    let Some(Value::Array(items)) = group.plan_params.get("actions") else {
        return Err(OrchError::Validation(
            "sequence plan requires an 'actions' array".into(),
        ));
    };
    items
        .iter()
        .enumerate()
        .map(|(i, v)| action_from(v, &format!("actions[{i}]")))
        .collect()
}

/// `action: Action, count: n` — the same action `n` times.
fn repeat_plan(group: &ProcessGroup) -> Result<Vec<Action>> {
    let template = group
        .plan_params
        .get("action")
        .ok_or_else(|| OrchError::Validation("repeat plan requires 'action'".into()))?;
    let template = action_from(template, "action")?;
    let count = group
        .plan_params
        .get("count")
        .and_then(Value::as_u64)
        .ok_or_else(|| OrchError::Validation("repeat plan requires integer 'count'".into()))?;
    Ok((0..count).map(|_| template.clone()).collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn sequence_plan_numbers_actions() {
        let lib = PlanLibrary::with_builtins();
        let pg = ProcessGroup::new("sequence", "x").with_plan_param(
            "actions",
            json!([
                {"server": "motion", "operation": "move"},
                {"server": "pstat", "operation": "run_cv"},
            ]),
        );
        let actions = lib.expand(&pg).unwrap();
        assert_eq!(actions.len(), 2);
        assert_eq!(actions[0].sequence, SequenceNumber::from(0.0));
        assert_eq!(actions[1].sequence, SequenceNumber::from(1.0));
        assert_eq!(actions[1].operation, "run_cv");
    }

    #[test]
    fn repeat_plan_copies_template() {
        let lib = PlanLibrary::with_builtins();
        let pg = ProcessGroup::new("repeat", "x")
            .with_plan_param("action", json!({"server": "sim", "operation": "wait"}))
            .with_plan_param("count", 3);
        let actions = lib.expand(&pg).unwrap();
        assert_eq!(actions.len(), 3);
        assert_eq!(actions[2].sequence, SequenceNumber::from(2.0));
    }

    #[test]
    fn unknown_plan_is_rejected() {
        let lib = PlanLibrary::with_builtins();
        let err = lib.expand(&ProcessGroup::new("nope", "x")).unwrap_err();
        assert!(matches!(err, OrchError::UnknownPlan(name) if name == "nope"));
    }

    #[test]
    fn custom_generator_closure() {
        let mut lib = PlanLibrary::new();
        lib.register("two_moves", |_: &ProcessGroup| {
            Ok(vec![Action::new("motion", "move"), Action::new("motion", "move")])
        });
        assert!(lib.contains("two_moves"));
        assert_eq!(lib.expand(&ProcessGroup::new("two_moves", "")).unwrap().len(), 2);
    }
}
