//! Opaque inference call, grounded on `inference.py`'s `_simulate_inference`
//! (prompt/max_tokens-scaled response, temperature-flavored suffix) kept as
//! the stand-in until a concrete ML framework is wired in — out of scope
//! per §1.

use async_trait::async_trait;
use moc_lifecycle::model::ModelHandle;

#[async_trait]
pub trait InferenceBackend: Send + Sync {
    async fn infer(
        &self,
        handle: &ModelHandle,
        prompt: &str,
        max_tokens: u32,
        temperature: f32,
    ) -> Result<(String, u32), String>;
}

pub struct MockInferenceBackend;

#[async_trait]
impl InferenceBackend for MockInferenceBackend {
    async fn infer(
        &self,
        _handle: &ModelHandle,
        prompt: &str,
        max_tokens: u32,
        temperature: f32,
    ) -> Result<(String, u32), String> {
        let tokens_generated = max_tokens.min(20 + (prompt.len() as u32 % 180));
        let mut text = format!(
            "Generated response for prompt: '{}...' (temp={temperature})",
            &prompt.chars().take(50).collect::<String>()
        );
        if temperature > 0.8 {
            text.push_str(" [High creativity mode]");
        } else if temperature < 0.3 {
            text.push_str(" [Focused mode]");
        }
        Ok((text, tokens_generated))
    }
}
