//! LLM collaborator contract (spec §4.4 item 4, §9 "LLM enhancement vs
//! verbatim").
//!
//! The engine never calls the LLM to rewrite a message for broadcast — it
//! only tags outbound envelopes with `suppress_llm` and leaves rewriting to
//! the downstream chat pipeline. The one place the engine itself calls an
//! LLM is player-choice persona-message generation, via the `genai` crate
//! already present in the dependency set.

use async_trait::async_trait;
use genai::chat::{ChatMessage, ChatRequest};
use genai::Client;
use tokio_util::sync::CancellationToken;

use crate::types::{Error, Result};

/// Generates a short in-character message committing to a player's choice.
/// Cancellable via `cancel` so a `pause_flows`/preemption can discard an
/// in-flight generation (spec §5).
#[async_trait]
pub trait LlmService: Send + Sync {
    async fn generate_choice_response(
        &self,
        system_prompt: &str,
        choice_label: &str,
        cancel: CancellationToken,
    ) -> Result<String>;
}

/// `genai`-backed implementation. Model id is configured at construction;
/// callers needing per-request overrides should wrap this in their own
/// `LlmService`.
pub struct GenaiLlmService {
    client: Client,
    model: String,
}

impl GenaiLlmService {
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            client: Client::default(),
            model: model.into(),
        }
    }
}

#[async_trait]
impl LlmService for GenaiLlmService {
    async fn generate_choice_response(
        &self,
        system_prompt: &str,
        choice_label: &str,
        cancel: CancellationToken,
    ) -> Result<String> {
        let request = ChatRequest::new(vec![
            ChatMessage::system(system_prompt.to_string()),
            ChatMessage::user(format!("The player chose: {choice_label}")),
        ]);

        tokio::select! {
            _ = cancel.cancelled() => Err(Error::cancelled("llm generation cancelled")),
            result = self.client.exec_chat(&self.model, request, None) => {
                let response = result.map_err(|e| Error::internal(format!("llm call failed: {e}")))?;
                response
                    .first_text()
                    .map(|s| s.to_string())
                    .ok_or_else(|| Error::internal("llm returned no text"))
            }
        }
    }
}

/// Verbatim echo, used by default and in tests — never fails, never
/// touches the network. Spec §4.5: LLM failures degrade to "deliver as
/// written", so this is a legitimate always-available fallback.
#[derive(Debug, Default)]
pub struct EchoLlm;

#[async_trait]
impl LlmService for EchoLlm {
    async fn generate_choice_response(
        &self,
        _system_prompt: &str,
        choice_label: &str,
        _cancel: CancellationToken,
    ) -> Result<String> {
        Ok(choice_label.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn echo_llm_returns_choice_label_verbatim() {
        let llm = EchoLlm;
        let out = llm
            .generate_choice_response("be brave", "fight", CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(out, "fight");
    }

    #[tokio::test]
    async fn echo_llm_respects_precancelled_token() {
        let llm = EchoLlm;
        let token = CancellationToken::new();
        // EchoLlm ignores cancellation (it never awaits anything
        // cancellable) — this documents that contract explicitly.
        token.cancel();
        let out = llm
            .generate_choice_response("be brave", "flee", token)
            .await
            .unwrap();
        assert_eq!(out, "flee");
    }
}
