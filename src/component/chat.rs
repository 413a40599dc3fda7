use std::path::{Path, PathBuf};

use anyhow::anyhow;
use chrono::NaiveDateTime;
use regex::Regex;

use crate::{
    llm::{ChatBackend, ChatRequest},
    sys::{
        chat_log::ChatLogStore,
        llm::{format_timestamp, ChatTurn, SamplingOptions},
        prompt::PromptAssembler,
        CharacterProfile,
    },
};

/// Delimits consecutive short messages inside one raw message. There is no escape.
pub const SEPARATOR: char = '~';

/// Stored and shown in place of a reply when the backend fails or returns nothing.
pub const FALLBACK_REPLY: &str =
    "Sorry, I couldn't come up with a reply right now. Please try again.";

/// Splits a raw message on [`SEPARATOR`], trimming each part and dropping empty ones.
pub fn split_messages(raw: &str) -> Vec<String> {
    raw.split(SEPARATOR)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect()
}

/// Matches a leading `[dd/mm/yyyy, HH:MM] - name:`, `name-dd/mm/yyyy, HH:MM:`,
/// bare `[dd/mm/yyyy, HH:MM]` or `name:` that the model copied from the history.
pub fn echoed_prefix(name: &str) -> anyhow::Result<Regex> {
    let name = regex::escape(name);
    let stamp = r"\d{1,2}/\d{1,2}/\d{4},?\s+\d{1,2}:\d{2}";
    let pattern = format!(
        r"^\s*(?:\[{stamp}\]\s*(?:-\s*{name}\s*:)?|{name}\s*-\s*{stamp}\s*:|{name}\s*:)\s*"
    );
    Regex::new(&pattern).map_err(|e| anyhow!("prefix pattern err:{e}"))
}

pub fn strip_echoed_prefix<'a>(text: &'a str, prefix: &Regex) -> &'a str {
    let mut text = text;
    while let Some(m) = prefix.find(text) {
        if m.end() == 0 {
            break;
        }
        text = &text[m.end()..];
    }
    text
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TurnOutcome {
    pub timestamp: String,
    pub user_messages: Vec<String>,
    pub assistant_messages: Vec<String>,
    pub fallback: bool,
}

/// Runs user -> assistant exchanges against one chat file.
pub struct ChatSession {
    store: ChatLogStore,
    chat: PathBuf,
    assembler: PromptAssembler,
    backend: Box<dyn ChatBackend>,
    ai: CharacterProfile,
    user: CharacterProfile,
    echo_prefix: Regex,
    model: String,
    stream: bool,
    sampling: SamplingOptions,
}

impl ChatSession {
    pub fn new(
        store: ChatLogStore,
        chat: impl Into<PathBuf>,
        assembler: PromptAssembler,
        backend: Box<dyn ChatBackend>,
        ai: CharacterProfile,
        user: CharacterProfile,
    ) -> anyhow::Result<Self> {
        Ok(Self {
            store: store.with_assistant(ai.name.clone()),
            chat: chat.into(),
            assembler,
            backend,
            echo_prefix: echoed_prefix(&ai.name)?,
            ai,
            user,
            model: String::new(),
            stream: true,
            sampling: SamplingOptions::default(),
        })
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    pub fn with_stream(mut self, stream: bool) -> Self {
        self.stream = stream;
        self
    }

    pub fn with_sampling(mut self, sampling: SamplingOptions) -> Self {
        self.sampling = sampling;
        self
    }

    pub fn ai(&self) -> &CharacterProfile {
        &self.ai
    }

    pub fn user(&self) -> &CharacterProfile {
        &self.user
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    pub fn chat_path(&self) -> &Path {
        &self.chat
    }

    pub fn history(&self) -> Vec<ChatTurn> {
        self.store.load(&self.chat)
    }

    pub fn send(&self, raw: &str, on_chunk: impl FnMut(&str)) -> TurnOutcome {
        self.send_at(raw, chrono::Local::now().naive_local(), on_chunk)
    }

    /// Executes one exchange. Never fails: any error is logged and answered
    /// with [`FALLBACK_REPLY`]. Turns appended before the error stay in the log.
    pub fn send_at(
        &self,
        raw: &str,
        now: NaiveDateTime,
        on_chunk: impl FnMut(&str),
    ) -> TurnOutcome {
        let mut outcome = TurnOutcome {
            timestamp: format_timestamp(&now),
            ..Default::default()
        };

        if let Err(e) = self.run_turn(raw, &mut outcome, on_chunk) {
            log::error!("chat turn failed: {e:#}");
            let fallback = ChatTurn::assistant(FALLBACK_REPLY).with_timestamp(&outcome.timestamp);
            if let Err(e) = self.store.append(&self.chat, fallback) {
                log::error!("append fallback reply err:{e:#}");
            }
            outcome.assistant_messages.push(FALLBACK_REPLY.to_string());
            outcome.fallback = true;
        }
        outcome
    }

    fn run_turn(
        &self,
        raw: &str,
        outcome: &mut TurnOutcome,
        on_chunk: impl FnMut(&str),
    ) -> anyhow::Result<()> {
        let user_messages = split_messages(raw);
        if user_messages.is_empty() {
            return Ok(());
        }
        for message in user_messages {
            let turn = ChatTurn::user(message.as_str()).with_timestamp(&outcome.timestamp);
            self.store.append(&self.chat, turn)?;
            outcome.user_messages.push(message);
        }

        let history = self.store.load(&self.chat);
        let messages =
            self.assembler
                .assemble(&history, &self.ai, &self.user, &outcome.timestamp)?;

        let reply = self.backend.chat(ChatRequest {
            model: &self.model,
            messages: &messages,
            stream: self.stream,
            sampling: self.sampling,
        })?;
        let text = reply.into_text(on_chunk)?;

        let replies: Vec<String> = split_messages(strip_echoed_prefix(&text, &self.echo_prefix))
            .iter()
            .map(|m| strip_echoed_prefix(m, &self.echo_prefix).trim().to_string())
            .filter(|m| !m.is_empty())
            .collect();
        if replies.is_empty() {
            return Err(anyhow!("backend returned an empty reply"));
        }

        for message in replies {
            let turn = ChatTurn::assistant(message.as_str()).with_timestamp(&outcome.timestamp);
            self.store.append(&self.chat, turn)?;
            outcome.assistant_messages.push(message);
        }
        Ok(())
    }
}
