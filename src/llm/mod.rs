use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use anyhow::anyhow;
use crossbeam::channel::{Receiver, Sender};

use crate::sys::llm::{ChatTurn, SamplingOptions};

pub mod ollama;

const STREAM_CAPACITY: usize = 64;

#[derive(Debug, Clone)]
pub enum Token {
    Chunk(String),
    End,
    Error(String),
}

#[derive(Debug, Clone, Copy)]
pub struct ChatRequest<'a> {
    pub model: &'a str,
    pub messages: &'a [ChatTurn],
    pub stream: bool,
    pub sampling: SamplingOptions,
}

pub enum ChatReply {
    Complete(ChatTurn),
    Stream(ChatStream),
}

impl ChatReply {
    /// Drains the reply into one string, handing each fragment to `on_chunk`
    /// in arrival order.
    pub fn into_text(self, mut on_chunk: impl FnMut(&str)) -> anyhow::Result<String> {
        match self {
            ChatReply::Complete(turn) => {
                on_chunk(&turn.content);
                Ok(turn.content)
            }
            ChatReply::Stream(stream) => {
                let mut text = String::new();
                for chunk in stream {
                    let chunk = chunk?;
                    on_chunk(&chunk);
                    text.push_str(&chunk);
                }
                Ok(text)
            }
        }
    }
}

pub trait ChatBackend {
    fn chat(&self, request: ChatRequest<'_>) -> anyhow::Result<ChatReply>;

    fn list_models(&self) -> anyhow::Result<Vec<String>>;
}

/// Producer half of a [`ChatStream`].
pub struct TokenSender {
    tx: Sender<Token>,
    cancelled: Arc<AtomicBool>,
}

impl TokenSender {
    /// Returns `false` once the consumer cancelled or went away.
    pub fn send(&self, token: Token) -> bool {
        if self.is_cancelled() {
            return false;
        }
        self.tx.send(token).is_ok()
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Relaxed)
    }
}

/// A finite stream of reply fragments fed by a producer thread. It ends at
/// `Token::End` or when the producer goes away, and cannot be restarted.
pub struct ChatStream {
    rx: Receiver<Token>,
    cancelled: Arc<AtomicBool>,
    finished: bool,
}

impl ChatStream {
    pub fn channel() -> (TokenSender, ChatStream) {
        let (tx, rx) = crossbeam::channel::bounded(STREAM_CAPACITY);
        let cancelled = Arc::new(AtomicBool::new(false));
        (
            TokenSender {
                tx,
                cancelled: cancelled.clone(),
            },
            ChatStream {
                rx,
                cancelled,
                finished: false,
            },
        )
    }

    /// Runs `producer` on its own thread. Its result becomes the final token.
    pub fn spawn<F>(producer: F) -> Self
    where
        F: FnOnce(&TokenSender) -> anyhow::Result<()> + Send + 'static,
    {
        let (tx, stream) = Self::channel();
        std::thread::spawn(move || match producer(&tx) {
            Ok(()) => {
                tx.send(Token::End);
            }
            Err(e) => {
                log::debug!("stream producer err:{e:#}");
                tx.send(Token::Error(format!("{e:#}")));
            }
        });
        stream
    }

    pub fn from_chunks<I>(chunks: I) -> Self
    where
        I: IntoIterator<Item = String>,
        I::IntoIter: Send + 'static,
    {
        let chunks = chunks.into_iter();
        Self::spawn(move |tx| {
            for chunk in chunks {
                if !tx.send(Token::Chunk(chunk)) {
                    break;
                }
            }
            Ok(())
        })
    }

    /// Stops the producer at its next fragment. The stream yields nothing more.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Relaxed);
    }
}

impl Iterator for ChatStream {
    type Item = anyhow::Result<String>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.finished || self.cancelled.load(Ordering::Relaxed) {
            return None;
        }

        match self.rx.recv() {
            Ok(Token::Chunk(chunk)) => Some(Ok(chunk)),
            Ok(Token::Error(e)) => {
                self.finished = true;
                Some(Err(anyhow!(e)))
            }
            Ok(Token::End) | Err(_) => {
                self.finished = true;
                None
            }
        }
    }
}

impl Drop for ChatStream {
    fn drop(&mut self) {
        self.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stream_yields_chunks_in_order() {
        let chunks = vec!["Hel".to_string(), "lo~".to_string(), "there".to_string()];
        let stream = ChatStream::from_chunks(chunks);
        let mut seen = Vec::new();
        let text = ChatReply::Stream(stream)
            .into_text(|c| seen.push(c.to_string()))
            .unwrap();
        assert_eq!(text, "Hello~there");
        assert_eq!(seen, vec!["Hel", "lo~", "there"]);
    }

    #[test]
    fn producer_error_ends_stream() {
        let mut stream = ChatStream::spawn(|tx| {
            tx.send(Token::Chunk("partial".to_string()));
            Err(anyhow!("connection reset"))
        });
        assert_eq!(stream.next().unwrap().unwrap(), "partial");
        let err = stream.next().unwrap().unwrap_err();
        assert!(err.to_string().contains("connection reset"));
        assert!(stream.next().is_none());
    }

    #[test]
    fn cancel_stops_producer() {
        let (done_tx, done_rx) = crossbeam::channel::bounded(1);
        let mut stream = ChatStream::spawn(move |tx| {
            let mut sent = 0usize;
            while tx.send(Token::Chunk("x".to_string())) {
                sent += 1;
            }
            let _ = done_tx.send(sent);
            Ok(())
        });

        assert!(stream.next().is_some());
        stream.cancel();
        assert!(stream.next().is_none());
        drop(stream);

        let sent = done_rx
            .recv_timeout(std::time::Duration::from_secs(5))
            .unwrap();
        assert!(sent >= 1);
    }

    #[test]
    fn complete_reply_is_one_chunk() {
        let mut seen = 0;
        let text = ChatReply::Complete(ChatTurn::assistant("hi~there"))
            .into_text(|_| seen += 1)
            .unwrap();
        assert_eq!(text, "hi~there");
        assert_eq!(seen, 1);
    }
}
