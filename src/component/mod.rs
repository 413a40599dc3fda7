use std::io::{BufRead, Write};

use chat::{split_messages, ChatSession, FALLBACK_REPLY, SEPARATOR};

use crate::sys::llm::{format_timestamp, Role};

pub mod chat;

/// Typed on its own line to leave the loop.
pub const QUIT: &str = "/q";

pub struct App {
    pub chat: ChatSession,
}

impl App {
    pub fn new(chat: ChatSession) -> Self {
        Self { chat }
    }

    fn display_name(&self, role: Role) -> &str {
        match role {
            Role::Assistant => self.chat.ai().name.as_str(),
            Role::User => self.chat.user().name.as_str(),
            Role::System => "system",
        }
    }

    pub fn print_history<W: Write>(&self, out: &mut W) -> std::io::Result<()> {
        let history = self.chat.history();
        if history.is_empty() {
            writeln!(out, "No chat history found")?;
            return Ok(());
        }

        writeln!(out, "\n======== Chat History ========")?;
        for turn in history {
            let name = self.display_name(turn.role);
            match &turn.timestamp {
                Some(timestamp) => writeln!(out, "\n[{timestamp}] - {name}:")?,
                None => writeln!(out, "\n{name}:")?,
            }
            writeln!(out, "{}", turn.content.replace(SEPARATOR, "\n"))?;
        }
        Ok(())
    }

    fn header<W: Write>(out: &mut W, name: &str) -> std::io::Result<()> {
        let now = chrono::Local::now().naive_local();
        writeln!(out, "\n\n[{}] - {}:", format_timestamp(&now), name)?;
        out.flush()
    }

    /// Reads one line per turn from `input` until [`QUIT`] or end of input.
    pub fn run<R: BufRead, W: Write>(&self, input: R, mut out: W) -> anyhow::Result<()> {
        log::info!(
            "chat `{}` with model `{}`",
            self.chat.chat_path().display(),
            self.chat.model()
        );
        self.print_history(&mut out)?;

        let mut lines = input.lines();
        loop {
            Self::header(&mut out, &self.chat.user().name)?;
            let Some(line) = lines.next() else {
                break;
            };
            let line = line?;
            let line = line.trim();
            if line == QUIT {
                break;
            }
            if split_messages(line).is_empty() {
                continue;
            }

            Self::header(&mut out, &self.chat.ai().name)?;
            let outcome = self.chat.send(line, |chunk| {
                let _ = write!(out, "{}", chunk.replace(SEPARATOR, "\n"));
                let _ = out.flush();
            });

            if outcome.fallback {
                writeln!(out, "\n{FALLBACK_REPLY}")?;
            } else {
                writeln!(out)?;
            }
        }
        Ok(())
    }

    pub fn run_loop(&self) -> anyhow::Result<()> {
        let stdin = std::io::stdin();
        self.run(stdin.lock(), std::io::stdout())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        debug_tool::EchoBackend,
        sys::{chat_log::ChatLogStore, prompt::PromptAssembler, CharacterProfile},
    };

    fn app(dir: &std::path::Path) -> App {
        let store = ChatLogStore::new(dir);
        let chat = store.create("repl").unwrap();
        let session = ChatSession::new(
            store,
            chat,
            PromptAssembler::builtin().unwrap(),
            Box::new(EchoBackend),
            CharacterProfile::new("replAI", "A helpful AI assistant"),
            CharacterProfile::new("Joe", "A student"),
        )
        .unwrap()
        .with_model("echo");
        App::new(session)
    }

    #[test]
    fn loop_runs_until_quit() {
        let dir = tempfile::tempdir().unwrap();
        let app = app(dir.path());
        let input = std::io::Cursor::new("hello~there\n\n/q\nnever sent\n");
        let mut out = Vec::new();
        app.run(input, &mut out).unwrap();

        let out = String::from_utf8(out).unwrap();
        assert!(out.contains("No chat history found"));
        assert!(out.contains("] - Joe:"));
        assert!(out.contains("] - replAI:"));
        assert!(out.contains("there\n"));
        let history: Vec<_> = app
            .chat
            .history()
            .into_iter()
            .map(|turn| (turn.role, turn.content))
            .collect();
        assert_eq!(
            history,
            vec![
                (Role::User, "hello".to_string()),
                (Role::User, "there".to_string()),
                (Role::Assistant, "there".to_string()),
            ]
        );
        assert!(app.chat.history().iter().all(|t| t.timestamp.is_some()));
    }

    #[test]
    fn separator_only_line_gets_no_reply() {
        let dir = tempfile::tempdir().unwrap();
        let app = app(dir.path());
        let mut out = Vec::new();
        app.run(std::io::Cursor::new(" ~ \n~\n/q\n"), &mut out).unwrap();

        let out = String::from_utf8(out).unwrap();
        assert!(!out.contains("] - replAI:"));
        assert!(app.chat.history().is_empty());
    }

    #[test]
    fn end_of_input_stops_loop() {
        let dir = tempfile::tempdir().unwrap();
        let app = app(dir.path());
        let mut out = Vec::new();
        app.run(std::io::Cursor::new("hi"), &mut out).unwrap();
        assert_eq!(app.chat.history().len(), 2);

        let mut out = Vec::new();
        app.print_history(&mut out).unwrap();
        let out = String::from_utf8(out).unwrap();
        assert!(out.contains("Chat History"));
        assert!(out.contains("] - Joe:\nhi\n"));
        assert!(out.contains("] - replAI:\nhi\n"));

        std::fs::write(
            app.chat.chat_path(),
            r#"{"version": 1, "turns": [{"role": "user", "content": "untimed"}]}"#,
        )
        .unwrap();
        let mut out = Vec::new();
        app.print_history(&mut out).unwrap();
        assert!(String::from_utf8(out).unwrap().contains("\nJoe:\nuntimed\n"));
    }
}
