
use serde::{Deserialize, Serialize};

use crate::text::tokenize;
use crate::Result;

/// One chat turn as sent over the wire.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

/// Sampling knobs forwarded to the model runtime.
#[derive(Debug, Clone)]
pub struct GenerateConfig {
    pub max_new_tokens: usize,
    pub temperature: f32,
    pub top_p: f32,
    pub top_k: usize,
    pub repetition_penalty: f32,
    pub beam_size: usize,
    pub do_sample: bool,
}

impl Default for GenerateConfig {
    #[inline]
    fn default() -> Self {
        Self {
            max_new_tokens: 512,
            temperature: 0.7,
            top_p: 0.9,
            top_k: 40,
            repetition_penalty: 1.1,
            beam_size: 1,
            do_sample: true,
        }
    }
}

/// Token accounting reported with every completion.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct Usage {
    pub prompt_tokens: usize,
    pub completion_tokens: usize,
}

/// Opaque conversation state returned by `prefill`.
pub struct PrefillState {
    prompt: String,
    prompt_tokens: usize,
}

impl PrefillState {
    #[inline]
    pub fn new(prompt: String, prompt_tokens: usize) -> Self {
        Self {
            prompt,
            prompt_tokens,
        }
    }

    #[inline]
    pub fn prompt(&self) -> &str {
        &self.prompt
    }

    #[inline]
    pub fn prompt_tokens(&self) -> usize {
        self.prompt_tokens
    }
}

/// The two-phase contract of the language-model runtime.
///
/// `generate` streams tokens through `on_token` until a stop criterion is
/// met; returning `false` from the callback means the consumer is gone and
/// generation stops early. Implementations are driven from a blocking
/// context under an exclusive lock, one generation at a time.
pub trait ChatModel: Send {
    fn name(&self) -> &str;

    fn apply_chat_template(
        &self,
        messages: &[ChatMessage],
        add_generation_prompt: bool,
        enable_thinking: bool,
    ) -> String;

    fn prefill(&mut self, prompt: &str) -> Result<PrefillState>;

    fn generate(
        &mut self,
        state: PrefillState,
        config: &GenerateConfig,
        on_token: &mut dyn FnMut(&str) -> bool,
    ) -> Result<Usage>;
}

/// Deterministic built-in model that answers by quoting the context block of
/// its prompt. Keeps the server and the chat path fully self-contained; a
/// real runtime plugs in behind the same trait.
pub struct ExtractiveModel {
    name: String,
}

impl ExtractiveModel {
    #[inline]
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }

    /// First context entry of the assembled system prompt, if any.
    fn first_context_snippet(prompt: &str) -> Option<(String, String)> {
        let context = prompt.split("Context:\n").nth(1)?;
        let entry = context.split("[1] Source: ").nth(1)?;
        let mut lines = entry.lines();
        let source = lines.next()?.trim().to_string();
        let snippet: String = lines
            .take_while(|line| !line.trim().is_empty() && !line.starts_with('['))
            .collect::<Vec<_>>()
            .join(" ");
        if snippet.trim().is_empty() {
            return None;
        }
        Some((source, snippet.trim().to_string()))
    }
}

impl ChatModel for ExtractiveModel {
    #[inline]
    fn name(&self) -> &str {
        &self.name
    }

    fn apply_chat_template(
        &self,
        messages: &[ChatMessage],
        add_generation_prompt: bool,
        enable_thinking: bool,
    ) -> String {
        let mut prompt = String::new();
        for message in messages {
            prompt.push_str("<|im_start|>");
            prompt.push_str(&message.role);
            prompt.push('\n');
            prompt.push_str(&message.content);
            prompt.push_str("<|im_end|>\n");
        }
        if add_generation_prompt {
            prompt.push_str("<|im_start|>assistant\n");
            if !enable_thinking {
                prompt.push_str("<think>\n\n</think>\n\n");
            }
        }
        prompt
    }

    fn prefill(&mut self, prompt: &str) -> Result<PrefillState> {
        let prompt_tokens = tokenize(prompt).len();
        Ok(PrefillState::new(prompt.to_string(), prompt_tokens))
    }

    fn generate(
        &mut self,
        state: PrefillState,
        config: &GenerateConfig,
        on_token: &mut dyn FnMut(&str) -> bool,
    ) -> Result<Usage> {
        let answer = match Self::first_context_snippet(state.prompt()) {
            Some((source, snippet)) => {
                format!("According to [1] ({source}): {snippet}")
            }
            None => "I do not know; the provided context does not contain the answer.".to_string(),
        };

        let mut completion_tokens = 0;
        for word in answer.split_inclusive(' ') {
            if completion_tokens >= config.max_new_tokens {
                break;
            }
            completion_tokens += 1;
            if !on_token(word) {
                break;
            }
        }

        Ok(Usage {
            prompt_tokens: state.prompt_tokens(),
            completion_tokens,
        })
    }
}
