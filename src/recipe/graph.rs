//! Recipe graph parsing and validation.
//!
//! On the wire a recipe is a JSON object whose numeric keys are step labels
//! and whose `start` key lists `[label, payload]` entry points. Each step may
//! carry `service`, `queue` (or `topic`), `parameters`, `output` and
//! `wrapper`. An `output` given as a bare label or list of labels is
//! normalized under the unnamed output `""`.

use serde_json::{Map, Value};
use std::collections::{BTreeMap, BTreeSet, VecDeque};

use super::{RecipeError, RecipeResult};

pub type StepLabel = u32;

/// Output name used for an `output` that is a bare label or list
pub const UNNAMED_OUTPUT: &str = "";

#[derive(Debug, Clone, PartialEq)]
pub struct RecipeStep {
    pub label: StepLabel,
    pub service: Option<String>,
    pub queue: Option<String>,
    pub topic: Option<String>,
    pub parameters: Map<String, Value>,
    /// Output name to downstream labels, in recipe order
    pub outputs: BTreeMap<String, Vec<StepLabel>>,
    pub wrapper: Option<Value>,
}

impl RecipeStep {
    fn parse(label: StepLabel, value: &Value) -> RecipeResult<Self> {
        let object = value
            .as_object()
            .ok_or_else(|| RecipeError::invalid_recipe(format!("step {label} is not an object")))?;

        let text = |key: &str| -> RecipeResult<Option<String>> {
            match object.get(key) {
                None | Some(Value::Null) => Ok(None),
                Some(Value::String(s)) => Ok(Some(s.clone())),
                Some(other) => Err(RecipeError::invalid_recipe(format!(
                    "step {label}: '{key}' must be a string, got {other}"
                ))),
            }
        };

        let parameters = match object.get("parameters") {
            None | Some(Value::Null) => Map::new(),
            Some(Value::Object(map)) => map.clone(),
            Some(_) => {
                return Err(RecipeError::invalid_recipe(format!(
                    "step {label}: 'parameters' must be a mapping"
                )))
            }
        };

        Ok(Self {
            label,
            service: text("service")?,
            queue: text("queue")?,
            topic: text("topic")?,
            parameters,
            outputs: parse_outputs(label, object.get("output"))?,
            wrapper: object.get("wrapper").filter(|w| !w.is_null()).cloned(),
        })
    }

    pub(crate) fn parameters_only(label: StepLabel, parameters: Map<String, Value>) -> Self {
        Self {
            label,
            service: None,
            queue: None,
            topic: None,
            parameters,
            outputs: BTreeMap::new(),
            wrapper: None,
        }
    }

    /// Downstream labels under one output name, empty if the name is absent
    pub fn output(&self, name: &str) -> &[StepLabel] {
        self.outputs.get(name).map(Vec::as_slice).unwrap_or_default()
    }
}

fn parse_label(value: &Value) -> Option<StepLabel> {
    match value {
        Value::Number(n) => n.as_u64().and_then(|n| StepLabel::try_from(n).ok()),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn parse_label_list(label: StepLabel, value: &Value) -> RecipeResult<Vec<StepLabel>> {
    let invalid =
        || RecipeError::invalid_recipe(format!("step {label}: invalid output target {value}"));
    match value {
        Value::Array(items) => items
            .iter()
            .map(|item| parse_label(item).ok_or_else(invalid))
            .collect(),
        single => parse_label(single).map(|l| vec![l]).ok_or_else(invalid),
    }
}

fn parse_outputs(
    label: StepLabel,
    value: Option<&Value>,
) -> RecipeResult<BTreeMap<String, Vec<StepLabel>>> {
    let mut outputs = BTreeMap::new();
    match value {
        None | Some(Value::Null) => {}
        Some(Value::Object(map)) => {
            for (name, targets) in map {
                outputs.insert(name.clone(), parse_label_list(label, targets)?);
            }
        }
        Some(other) => {
            outputs.insert(UNNAMED_OUTPUT.to_string(), parse_label_list(label, other)?);
        }
    }
    Ok(outputs)
}

/// A validated recipe
#[derive(Debug, Clone)]
pub struct Recipe {
    steps: BTreeMap<StepLabel, RecipeStep>,
    start: Vec<(StepLabel, Value)>,
    raw: Value,
}

impl Recipe {
    /// Parse and validate a recipe from its JSON form
    pub fn parse(value: &Value) -> RecipeResult<Self> {
        let object = value
            .as_object()
            .ok_or_else(|| RecipeError::invalid_recipe("recipe is not an object"))?;

        let mut steps = BTreeMap::new();
        let mut start = Vec::new();
        for (key, entry) in object {
            if key == "start" {
                start = parse_start(entry)?;
                continue;
            }
            match key.trim().parse::<StepLabel>() {
                Ok(label) => {
                    steps.insert(label, RecipeStep::parse(label, entry)?);
                }
                // Recipe-level metadata such as "error" or "description"
                Err(_) => tracing::trace!(key = %key, "Ignoring non-step recipe key"),
            }
        }

        let recipe = Self {
            steps,
            start,
            raw: value.clone(),
        };
        recipe.validate()?;
        Ok(recipe)
    }

    /// One-step recipe holding only parameters, used to give simple
    /// messages the same surface as recipe messages
    pub fn single_step(parameters: Map<String, Value>) -> Self {
        let step = RecipeStep::parameters_only(1, parameters.clone());
        Self {
            steps: BTreeMap::from([(1, step)]),
            start: vec![(1, Value::Array(Vec::new()))],
            raw: serde_json::json!({"1": {"parameters": parameters}, "start": [[1, []]]}),
        }
    }

    fn validate(&self) -> RecipeResult<()> {
        if self.start.is_empty() {
            return Err(RecipeError::invalid_recipe("recipe has no start steps"));
        }
        for (label, _) in &self.start {
            if !self.steps.contains_key(label) {
                return Err(RecipeError::invalid_recipe(format!(
                    "start references undefined step {label}"
                )));
            }
        }
        for step in self.steps.values() {
            for (name, targets) in &step.outputs {
                if let Some(missing) = targets.iter().find(|t| !self.steps.contains_key(*t)) {
                    return Err(RecipeError::invalid_recipe(format!(
                        "step {} output '{name}' references undefined step {missing}",
                        step.label
                    )));
                }
            }
        }
        Ok(())
    }

    pub fn step(&self, label: StepLabel) -> RecipeResult<&RecipeStep> {
        self.steps
            .get(&label)
            .ok_or_else(|| RecipeError::missing_step(label))
    }

    pub fn outputs(&self, label: StepLabel) -> RecipeResult<&BTreeMap<String, Vec<StepLabel>>> {
        Ok(&self.step(label)?.outputs)
    }

    /// Entry points with their initial payloads
    pub fn start_set(&self) -> &[(StepLabel, Value)] {
        &self.start
    }

    pub fn labels(&self) -> impl Iterator<Item = StepLabel> + '_ {
        self.steps.keys().copied()
    }

    /// Labels reachable from the start set
    pub fn reachable(&self) -> BTreeSet<StepLabel> {
        let mut seen = BTreeSet::new();
        let mut pending: VecDeque<StepLabel> = self.start.iter().map(|(l, _)| *l).collect();
        while let Some(label) = pending.pop_front() {
            if !seen.insert(label) {
                continue;
            }
            if let Some(step) = self.steps.get(&label) {
                pending.extend(step.outputs.values().flatten().copied());
            }
        }
        seen
    }

    /// The recipe as originally received, for forwarding in envelopes
    pub fn to_value(&self) -> Value {
        self.raw.clone()
    }
}

fn parse_start(value: &Value) -> RecipeResult<Vec<(StepLabel, Value)>> {
    let entries = value
        .as_array()
        .ok_or_else(|| RecipeError::invalid_recipe("'start' must be a list"))?;
    entries
        .iter()
        .map(|entry| match entry {
            Value::Array(pair) if !pair.is_empty() => {
                let label = parse_label(&pair[0]).ok_or_else(|| {
                    RecipeError::invalid_recipe(format!("invalid start label {}", pair[0]))
                })?;
                Ok((label, pair.get(1).cloned().unwrap_or(Value::Null)))
            }
            other => parse_label(other)
                .map(|label| (label, Value::Null))
                .ok_or_else(|| RecipeError::invalid_recipe(format!("invalid start entry {other}"))),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample() -> Value {
        json!({
            "1": {
                "service": "Filewatcher",
                "queue": "filewatcher",
                "parameters": {"pattern": "/dls/tst_%05d.cbf", "pattern-start": 1},
                "output": {"first": 2, "every": [2, 3], "finally": "4"}
            },
            "2": {"queue": "trigger", "output": 4},
            "3": {"topic": "transient_status", "output": [4]},
            "4": {"queue": "ispyb_connector"},
            "start": [[1, []]],
            "description": "test recipe"
        })
    }

    #[test]
    fn test_parse_normalizes_outputs() {
        let recipe = Recipe::parse(&sample()).unwrap();
        let step = recipe.step(1).unwrap();
        assert_eq!(step.service.as_deref(), Some("Filewatcher"));
        assert_eq!(step.output("first"), &[2]);
        assert_eq!(step.output("every"), &[2, 3]);
        assert_eq!(step.output("finally"), &[4]);
        assert!(step.output("last").is_empty());

        assert_eq!(recipe.step(2).unwrap().output(UNNAMED_OUTPUT), &[4]);
        assert_eq!(recipe.step(3).unwrap().topic.as_deref(), Some("transient_status"));
        assert_eq!(recipe.start_set(), &[(1, json!([]))]);
    }

    #[test]
    fn test_dangling_output_rejected() {
        let mut value = sample();
        value["2"]["output"] = json!({"next": 9});
        let err = Recipe::parse(&value).unwrap_err();
        assert!(err.to_string().contains("undefined step 9"));
    }

    #[test]
    fn test_empty_start_rejected() {
        let mut value = sample();
        value["start"] = json!([]);
        assert!(matches!(
            Recipe::parse(&value),
            Err(RecipeError::InvalidRecipe { .. })
        ));
    }

    #[test]
    fn test_reachable_outputs_stay_reachable() {
        let recipe = Recipe::parse(&sample()).unwrap();
        let reachable = recipe.reachable();
        assert_eq!(reachable.iter().copied().collect::<Vec<_>>(), vec![1, 2, 3, 4]);
        for label in &reachable {
            for targets in recipe.outputs(*label).unwrap().values() {
                assert!(targets.iter().all(|t| reachable.contains(t)));
            }
        }
    }

    #[test]
    fn test_missing_step_lookup() {
        let recipe = Recipe::parse(&sample()).unwrap();
        assert!(matches!(
            recipe.step(42),
            Err(RecipeError::MissingStep { label: 42 })
        ));
    }
}
