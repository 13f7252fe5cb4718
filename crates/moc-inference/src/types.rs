use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Deserialize)]
pub struct InferenceRequest {
    pub model_name: String,
    pub prompt: String,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    pub conversation_id: Option<String>,
}

fn default_max_tokens() -> u32 {
    100
}
fn default_temperature() -> f32 {
    0.7
}

#[derive(Debug, Clone, Serialize)]
pub struct InferenceResult {
    pub text: String,
    pub tokens_generated: u32,
    pub elapsed_ms: f64,
    pub status: &'static str,
    pub error: Option<String>,
}
