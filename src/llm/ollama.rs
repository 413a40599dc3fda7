use std::io::BufRead;
use std::time::Duration;

use anyhow::{anyhow, Context};

use super::{ChatBackend, ChatReply, ChatRequest, ChatStream, Token, TokenSender};
use crate::sys::llm::{ChatTurn, Role, SamplingOptions};

pub const DEFAULT_BASE_URL: &str = "http://localhost:11434";

#[derive(Debug, serde::Serialize)]
struct ChatBody<'a> {
    model: &'a str,
    messages: &'a [ChatTurn],
    stream: bool,
    #[serde(skip_serializing_if = "SamplingOptions::is_empty")]
    options: SamplingOptions,
}

#[derive(Debug, Default, serde::Deserialize)]
struct WireMessage {
    #[serde(default)]
    role: Option<Role>,
    #[serde(default)]
    content: String,
}

/// One `/api/chat` reply object; a stream is a sequence of these, one per line.
#[derive(Debug, serde::Deserialize)]
struct ChatChunk {
    #[serde(default)]
    message: Option<WireMessage>,
    #[serde(default)]
    done: bool,
    #[serde(default)]
    error: Option<String>,
}

impl ChatChunk {
    fn parse(line: &str) -> anyhow::Result<Self> {
        let chunk: ChatChunk =
            serde_json::from_str(line).with_context(|| format!("bad chat chunk `{line}`"))?;
        if let Some(e) = chunk.error.as_deref() {
            return Err(anyhow!("backend error: {e}"));
        }
        Ok(chunk)
    }
}

#[derive(Debug, serde::Deserialize)]
struct TagList {
    #[serde(default)]
    models: Vec<ModelTag>,
}

#[derive(Debug, serde::Deserialize)]
struct ModelTag {
    name: String,
}

/// Client for an Ollama-compatible inference server.
pub struct OllamaBackend {
    client: reqwest::blocking::Client,
    base_url: String,
}

impl OllamaBackend {
    pub fn new(
        base_url: impl Into<String>,
        request_timeout: Option<Duration>,
        connect_timeout: Duration,
    ) -> anyhow::Result<Self> {
        let client = reqwest::blocking::Client::builder()
            .timeout(request_timeout)
            .connect_timeout(connect_timeout)
            .build()
            .context("build http client")?;

        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }
}

fn check_status(
    response: reqwest::blocking::Response,
) -> anyhow::Result<reqwest::blocking::Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().unwrap_or_default();
    Err(anyhow!("backend returned {status}: {}", body.trim()))
}

/// Forwards every line of an NDJSON chat stream to `tx` until `done` or cancel.
fn pump<R: BufRead>(reader: R, tx: &TokenSender) -> anyhow::Result<()> {
    for line in reader.lines() {
        let line = line.context("read chat stream")?;
        if line.trim().is_empty() {
            continue;
        }

        let chunk = ChatChunk::parse(&line)?;
        let content = chunk.message.map(|m| m.content).unwrap_or_default();
        if !content.is_empty() && !tx.send(Token::Chunk(content)) {
            log::debug!("chat stream cancelled");
            return Ok(());
        }
        if chunk.done {
            break;
        }
    }
    Ok(())
}

impl ChatBackend for OllamaBackend {
    fn chat(&self, request: ChatRequest<'_>) -> anyhow::Result<ChatReply> {
        let body = ChatBody {
            model: request.model,
            messages: request.messages,
            stream: request.stream,
            options: request.sampling,
        };
        log::debug!(
            "POST /api/chat model={} messages={} stream={}",
            request.model,
            request.messages.len(),
            request.stream
        );

        let response = self
            .client
            .post(self.url("/api/chat"))
            .json(&body)
            .send()
            .with_context(|| format!("send chat request to {}", self.base_url))?;
        let response = check_status(response)?;

        if request.stream {
            let reader = std::io::BufReader::new(response);
            return Ok(ChatReply::Stream(ChatStream::spawn(move |tx| {
                pump(reader, tx)
            })));
        }

        let text = response.text().context("read chat response")?;
        let chunk = ChatChunk::parse(&text)?;
        let message = chunk.message.unwrap_or_default();
        Ok(ChatReply::Complete(ChatTurn::new(
            message.role.unwrap_or(Role::Assistant),
            message.content,
        )))
    }

    fn list_models(&self) -> anyhow::Result<Vec<String>> {
        let response = self
            .client
            .get(self.url("/api/tags"))
            .send()
            .with_context(|| format!("list models from {}", self.base_url))?;
        let tags: TagList = check_status(response)?.json().context("parse model list")?;
        Ok(tags.models.into_iter().map(|m| m.name).collect())
    }
}
