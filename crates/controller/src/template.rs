//! `{{inputs.NAME}}` and `{{tasks.TASK.outputs.NAME}}` substitution.

use std::borrow::Cow;
use std::collections::HashMap;
use std::sync::LazyLock;

use regex::{Captures, Regex};

use crate::api::Workflow;

static TOKEN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\{\{([^{}]+)\}\}").expect("valid token pattern"));

/// Token values known for one workflow at one point in time.
///
/// Replacement is literal and case-sensitive. Each occurrence is replaced
/// once; substituted text is not scanned again. Unknown tokens are left as
/// they are.
#[derive(Debug, Clone, Default)]
pub struct Substitutions {
    values: HashMap<String, String>,
}

impl Substitutions {
    /// Collect workflow inputs and every output recorded in task status.
    pub fn from_workflow(workflow: &Workflow) -> Self {
        let mut values = HashMap::new();

        for input in &workflow.spec.inputs {
            values.insert(format!("inputs.{}", input.name), input.value.clone());
        }

        for status in workflow.task_status().into_iter().flat_map(|s| s.values()) {
            for output in &status.results {
                values.insert(
                    format!("tasks.{}.outputs.{}", status.name, output.name),
                    output.value.clone(),
                );
            }
        }

        Self { values }
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn apply<'t>(&self, text: &'t str) -> Cow<'t, str> {
        if self.values.is_empty() {
            return Cow::Borrowed(text);
        }
        TOKEN.replace_all(text, |caps: &Captures| match self.values.get(&caps[1]) {
            Some(value) => value.clone(),
            None => caps[0].to_string(),
        })
    }
}
