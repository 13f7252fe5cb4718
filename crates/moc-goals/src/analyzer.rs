//! Goal decomposition — §4.6 "pluggable analyzer; default is keyword-based",
//! grounded verbatim on the original's `_analyze_goal_requirements`:
//! sniff the description for `train`/`fine-tune`, `evaluate`/`test`,
//! `process`/`prepare`, falling back to a single generic step when none
//! match.

use serde_json::Value;

#[derive(Debug, Clone)]
pub enum Step {
    SubmitLearningJob {
        job_type: String,
        model_name: String,
        dataset_ref: String,
        params: Value,
    },
    EvaluateModel,
    ProcessData,
    GenericWait,
}

/// A pluggable decomposition strategy. The default keyword analyzer below
/// is the only implementation the original ships; callers may substitute
/// their own.
pub trait GoalAnalyzer: Send + Sync {
    fn analyze(&self, description: &str, metadata: &Value) -> Vec<Step>;
}

#[derive(Default)]
pub struct KeywordAnalyzer;

impl GoalAnalyzer for KeywordAnalyzer {
    fn analyze(&self, description: &str, metadata: &Value) -> Vec<Step> {
        let lower = description.to_lowercase();
        let mut steps = Vec::new();

        if lower.contains("train") || lower.contains("fine-tune") {
            steps.push(Step::SubmitLearningJob {
                job_type: "fine_tune".to_string(),
                model_name: metadata
                    .get("model_name")
                    .and_then(|v| v.as_str())
                    .unwrap_or("default-model")
                    .to_string(),
                dataset_ref: metadata
                    .get("dataset_path")
                    .and_then(|v| v.as_str())
                    .unwrap_or("/datasets/default.json")
                    .to_string(),
                params: metadata.get("training_params").cloned().unwrap_or(Value::Null),
            });
        }

        if lower.contains("evaluate") || lower.contains("test") {
            steps.push(Step::EvaluateModel);
        }

        if lower.contains("process") || lower.contains("prepare") {
            steps.push(Step::ProcessData);
        }

        if steps.is_empty() {
            steps.push(Step::GenericWait);
        }

        steps
    }
}
