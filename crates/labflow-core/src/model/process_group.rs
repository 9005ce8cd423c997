use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use uuid::Uuid;

use super::action::{Action, ProcessGroupRef, SequenceNumber};

/// One planned batch of actions sharing a label and timestamp.
///
/// `id` and `started_at` stay empty while the group waits in the queue and
/// are assigned by [`ProcessGroup::activate`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessGroup {
    #[serde(default)]
    pub id: Option<Uuid>,
    #[serde(default)]
    pub label: String,
    #[serde(default)]
    pub orchestrator: String,
    /// Name of the plan generator that expands this group.
    pub plan: String,
    #[serde(default)]
    pub plan_params: Map<String, Value>,
    /// Shared parameters actions pull from and push into.
    #[serde(default)]
    pub global_params: Map<String, Value>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    /// Raw dispatch responses keyed by action sequence number.
    #[serde(default, with = "seq_keyed")]
    pub results: BTreeMap<SequenceNumber, Action>,
}

impl ProcessGroup {
    pub fn new(plan: impl Into<String>, label: impl Into<String>) -> Self {
        Self {
            id: None,
            label: label.into(),
            orchestrator: String::new(),
            plan: plan.into(),
            plan_params: Map::new(),
            global_params: Map::new(),
            started_at: None,
            results: BTreeMap::new(),
        }
    }

    pub fn with_plan_param(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.plan_params.insert(key.into(), value.into());
        self
    }

    pub fn with_global_param(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.global_params.insert(key.into(), value.into());
        self
    }

    /// Assign identity when the group becomes the active one.
    pub fn activate(&mut self) -> ProcessGroupRef {
        let id = *self.id.get_or_insert_with(Uuid::new_v4);
        let started_at = *self.started_at.get_or_insert_with(Utc::now);
        self.results.clear();
        ProcessGroupRef {
            id,
            label: self.label.clone(),
            started_at,
        }
    }

    pub fn reference(&self) -> Option<ProcessGroupRef> {
        Some(ProcessGroupRef {
            id: self.id?,
            label: self.label.clone(),
            started_at: self.started_at?,
        })
    }

    /// Copy the parameters an action pulls from this group into the action.
    pub fn pull_into(&self, action: &mut Action) {
        for (group_key, param_key) in &action.from_global_params {
            if let Some(v) = self.global_params.get(group_key) {
                action.params.insert(param_key.clone(), v.clone());
            }
        }
    }

    /// Copy the keys an action pushes back out of its dispatch response.
    ///
    /// A key answered with `null` is removed from the group.
    pub fn push_from(&mut self, response: &Action) {
        for key in &response.to_global_params {
            match response.process_params.get(key) {
                Some(Value::Null) => {
                    self.global_params.remove(key);
                }
                Some(v) => {
                    self.global_params.insert(key.clone(), v.clone());
                }
                None => {}
            }
        }
    }
}

/// Serialize a sequence-keyed map with string keys, as JSON requires.
mod seq_keyed {
    use super::{Action, SequenceNumber};
    use serde::de::Error as _;
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::collections::BTreeMap;

    pub fn serialize<S>(map: &BTreeMap<SequenceNumber, Action>, s: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let keyed: BTreeMap<String, &Action> =
            map.iter().map(|(k, v)| (k.to_string(), v)).collect();
        keyed.serialize(s)
    }

    pub fn deserialize<'de, D>(d: D) -> Result<BTreeMap<SequenceNumber, Action>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let keyed: BTreeMap<String, Action> = BTreeMap::deserialize(d)?;
        keyed
            .into_iter()
            .map(|(k, v)| {
                k.parse::<SequenceNumber>()
                    .map(|seq| (seq, v))
                    .map_err(|e| D::Error::custom(format!("bad sequence key '{k}': {e}")))
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn activate_assigns_identity_once() {
        let mut pg = ProcessGroup::new("sequence", "cv-sweep");
        assert!(pg.reference().is_none());
        let first = pg.activate();
        let second = pg.activate();
        assert_eq!(first.id, second.id);
        assert_eq!(pg.reference().unwrap().label, "cv-sweep");
    }

    #[test]
    fn pull_copies_mapped_params() {
        let pg = ProcessGroup::new("sequence", "x").with_global_param("ref_potential", 0.21);
        let mut action = Action::new("pstat", "run_cv");
        action
            .from_global_params
            .insert("ref_potential".into(), "e_ref".into());
        action
            .from_global_params
            .insert("missing".into(), "ignored".into());
        pg.pull_into(&mut action);
        assert_eq!(action.params["e_ref"], json!(0.21));
        assert!(!action.params.contains_key("ignored"));
    }

    #[test]
    fn push_inserts_and_deletes() {
        let mut pg = ProcessGroup::new("sequence", "x").with_global_param("stale", 1);
        let mut response = Action::new("pstat", "run_cv");
        response.to_global_params = vec!["stale".into(), "ocv".into(), "absent".into()];
        response.process_params.insert("stale".into(), Value::Null);
        response.process_params.insert("ocv".into(), json!(0.45));
        pg.push_from(&response);
        assert!(!pg.global_params.contains_key("stale"));
        assert_eq!(pg.global_params["ocv"], json!(0.45));
        assert!(!pg.global_params.contains_key("absent"));
    }

    #[test]
    fn results_serialize_with_string_keys() {
        let mut pg = ProcessGroup::new("sequence", "x");
        pg.results
            .insert(SequenceNumber::from(1.01), Action::new("a", "b"));
        let v = serde_json::to_value(&pg).unwrap();
        assert!(v["results"]["1.01"].is_object());
        let back: ProcessGroup = serde_json::from_value(v).unwrap();
        assert!(back.results.contains_key(&SequenceNumber::from(1.01)));
    }
}
