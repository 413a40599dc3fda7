use crate::{
    llm::{ChatBackend, ChatReply, ChatRequest, ChatStream},
    sys::llm::{ChatTurn, Role},
};

/// Offline backend that answers with the last user message, minus any
/// `[time] - name:` history prefix. Used by `--debug-llm`.
#[derive(Debug, Default, Clone, Copy)]
pub struct EchoBackend;

impl EchoBackend {
    fn last_user_message(messages: &[ChatTurn]) -> String {
        messages
            .iter()
            .rev()
            .find(|turn| turn.role == Role::User)
            .map(|turn| Self::message_text(&turn.content).to_string())
            .unwrap_or_default()
    }

    fn message_text(content: &str) -> &str {
        if !content.starts_with('[') {
            return content;
        }
        content
            .split_once("] - ")
            .and_then(|(_, rest)| rest.split_once(": "))
            .map_or(content, |(_, text)| text)
    }
}

impl ChatBackend for EchoBackend {
    fn chat(&self, request: ChatRequest<'_>) -> anyhow::Result<ChatReply> {
        let message = Self::last_user_message(request.messages);
        if !request.stream {
            return Ok(ChatReply::Complete(ChatTurn::assistant(message)));
        }

        // one fragment per word, keeping the separators
        let chunks: Vec<String> = message
            .split_inclusive(' ')
            .map(|s| s.to_string())
            .collect();
        Ok(ChatReply::Stream(ChatStream::from_chunks(chunks)))
    }

    fn list_models(&self) -> anyhow::Result<Vec<String>> {
        Ok(vec!["echo".to_string()])
    }
}
