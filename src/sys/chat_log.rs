use std::path::{Path, PathBuf};

use anyhow::Context;

use super::llm::{ChatTurn, Role};

/// Schema version written by [`ChatLogStore::save`].
pub const LOG_VERSION: u32 = 1;

/// Older `{sender, timestamp, message}` record.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct LegacyRecord {
    pub sender: String,
    pub timestamp: String,
    pub message: String,
}

/// One line of a newline-delimited log: `{sender, content, date, time}`.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct LineRecord {
    pub sender: String,
    pub content: String,
    pub date: String,
    pub time: String,
}

/// Any record shape that may be found in a chat file.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(untagged)]
pub enum LogEntry {
    Turn(ChatTurn),
    Legacy(LegacyRecord),
    Line(LineRecord),
}

impl From<ChatTurn> for LogEntry {
    fn from(turn: ChatTurn) -> Self {
        LogEntry::Turn(turn)
    }
}

impl LogEntry {
    /// Maps the entry to a canonical turn. Sender-attributed records become
    /// `assistant` only when the sender equals `assistant`.
    pub fn into_turn(self, assistant: Option<&str>) -> ChatTurn {
        let role_of = |sender: &str| {
            if Some(sender) == assistant {
                Role::Assistant
            } else {
                Role::User
            }
        };

        match self {
            LogEntry::Turn(turn) => turn,
            LogEntry::Legacy(record) => ChatTurn::new(
                role_of(&record.sender),
                format!(
                    "[{}] - {}: {}",
                    record.timestamp, record.sender, record.message
                ),
            ),
            LogEntry::Line(record) => ChatTurn::new(
                role_of(&record.sender),
                format!(
                    "[{}, {}] - {}: {}",
                    record.date, record.time, record.sender, record.content
                ),
            ),
        }
    }
}

pub fn normalize<I>(entries: I, assistant: Option<&str>) -> Vec<ChatTurn>
where
    I: IntoIterator<Item = LogEntry>,
{
    entries
        .into_iter()
        .map(|entry| entry.into_turn(assistant))
        .collect()
}

#[derive(Debug, serde::Serialize, serde::Deserialize)]
struct LogDocument {
    version: u32,
    turns: Vec<ChatTurn>,
}

#[derive(Debug, serde::Deserialize)]
#[serde(untagged)]
enum StoredLog {
    Versioned(LogDocument),
    Records(Vec<LogEntry>),
}

enum Parsed {
    Canonical(Vec<ChatTurn>),
    Mixed(Vec<LogEntry>),
}

fn parse_log(text: &str) -> anyhow::Result<Parsed> {
    if text.trim().is_empty() {
        return Ok(Parsed::Canonical(Vec::new()));
    }

    match serde_json::from_str::<StoredLog>(text) {
        Ok(StoredLog::Versioned(doc)) if doc.version == LOG_VERSION => {
            Ok(Parsed::Canonical(doc.turns))
        }
        Ok(StoredLog::Versioned(doc)) => {
            Err(anyhow::anyhow!("unsupported log version {}", doc.version))
        }
        Ok(StoredLog::Records(records)) => Ok(Parsed::Mixed(records)),
        Err(_) => {
            let mut records = Vec::new();
            for (n, line) in text.lines().enumerate() {
                if line.trim().is_empty() {
                    continue;
                }
                let record = serde_json::from_str::<LogEntry>(line)
                    .with_context(|| format!("line {}", n + 1))?;
                records.push(record);
            }
            Ok(Parsed::Mixed(records))
        }
    }
}

/// Owns the chat files under one directory.
#[derive(Debug, Clone)]
pub struct ChatLogStore {
    dir: PathBuf,
    assistant: Option<String>,
}

impl ChatLogStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            assistant: None,
        }
    }

    /// Sender name classified as `assistant` when converting sender-attributed records.
    pub fn with_assistant(mut self, name: impl Into<String>) -> Self {
        self.assistant = Some(name.into());
        self
    }

    pub fn path_for(&self, name: &str) -> PathBuf {
        self.dir.join(format!("{name}.json"))
    }

    pub fn list(&self) -> anyhow::Result<Vec<String>> {
        super::list_stems(&self.dir, "json")
    }

    /// Creates an empty log for `name` unless one already exists.
    pub fn create(&self, name: &str) -> anyhow::Result<PathBuf> {
        std::fs::create_dir_all(&self.dir)
            .with_context(|| format!("create chats dir `{}`", self.dir.display()))?;
        let path = self.path_for(name);
        if !path.exists() {
            self.save(&path, Vec::<LogEntry>::new())?;
            log::info!("created chat `{}`", path.display());
        }
        Ok(path)
    }

    /// Reads the log at `path`. Missing or unreadable files are empty. A file in
    /// an older shape is rewritten in the canonical schema.
    pub fn load(&self, path: &Path) -> Vec<ChatTurn> {
        let text = match std::fs::read_to_string(path) {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Vec::new(),
            Err(e) => {
                log::warn!("read chat `{}` err:{e}", path.display());
                return Vec::new();
            }
        };

        match parse_log(&text) {
            Ok(Parsed::Canonical(turns)) => turns,
            Ok(Parsed::Mixed(records)) => {
                let turns = normalize(records, self.assistant.as_deref());
                log::info!(
                    "migrating chat `{}` to log version {LOG_VERSION}",
                    path.display()
                );
                if let Err(e) = self.write_turns(path, &turns) {
                    log::warn!("rewrite chat `{}` err:{e:#}", path.display());
                }
                turns
            }
            Err(e) => {
                log::warn!("chat `{}` is malformed, treating as empty: {e:#}", path.display());
                Vec::new()
            }
        }
    }

    /// Rewrites the whole log. Non-canonical entries are normalized first.
    pub fn save<I>(&self, path: &Path, entries: I) -> anyhow::Result<()>
    where
        I: IntoIterator<Item = LogEntry>,
    {
        let turns = normalize(entries, self.assistant.as_deref());
        self.write_turns(path, &turns)
    }

    pub fn append(&self, path: &Path, turn: ChatTurn) -> anyhow::Result<()> {
        let mut turns = self.load(path);
        turns.push(turn);
        self.write_turns(path, &turns)
    }

    fn write_turns(&self, path: &Path, turns: &[ChatTurn]) -> anyhow::Result<()> {
        let doc = LogDocument {
            version: LOG_VERSION,
            turns: turns.to_vec(),
        };
        let text = serde_json::to_string_pretty(&doc)?;
        std::fs::write(path, text).map_err(|e| anyhow::anyhow!("save to file err:{e}"))
    }
}
