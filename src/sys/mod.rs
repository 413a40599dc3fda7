use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context};

pub mod chat_log;
pub mod llm;
pub mod prompt;

/// A persona taking part in a chat, loaded from `<characters_dir>/<name>.toml`.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct CharacterProfile {
    pub name: String,
    pub description: String,
}

impl CharacterProfile {
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
        }
    }

    pub fn from_toml(text: &str) -> anyhow::Result<Self> {
        let profile: CharacterProfile = toml::from_str(text)?;
        if profile.name.trim().is_empty() {
            return Err(anyhow!("character `name` is empty"));
        }
        Ok(profile)
    }

    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|_| anyhow!("character file `{}` not found", path.display()))?;
        Self::from_toml(&text)
            .with_context(|| format!("invalid character file `{}`", path.display()))
    }
}

/// The directory of character files, addressed by file stem.
#[derive(Debug, Clone)]
pub struct ProfileLibrary {
    dir: PathBuf,
}

impl ProfileLibrary {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn path_for(&self, name: &str) -> PathBuf {
        self.dir.join(format!("{name}.toml"))
    }

    pub fn load(&self, name: &str) -> anyhow::Result<CharacterProfile> {
        CharacterProfile::load(self.path_for(name))
    }

    /// Raw file text, shown as character info.
    pub fn raw(&self, name: &str) -> anyhow::Result<String> {
        let path = self.path_for(name);
        std::fs::read_to_string(&path)
            .map_err(|_| anyhow!("character file `{}` not found", path.display()))
    }

    pub fn list(&self) -> anyhow::Result<Vec<String>> {
        list_stems(&self.dir, "toml")
    }
}

/// Sorted file stems in `dir` with the given extension. A missing directory is empty.
pub(crate) fn list_stems(dir: &Path, extension: &str) -> anyhow::Result<Vec<String>> {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e).with_context(|| format!("read dir `{}`", dir.display())),
    };

    let mut names = Vec::new();
    for entry in entries {
        let path = entry?.path();
        if path.extension().and_then(|e| e.to_str()) != Some(extension) {
            continue;
        }
        if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
            names.push(stem.to_string());
        }
    }
    names.sort();
    Ok(names)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_profile_from_library() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("replai.toml"),
            "name = \"replAI\"\ndescription = \"A helpful AI assistant\"\n",
        )
        .unwrap();
        std::fs::write(dir.path().join("notes.txt"), "ignored").unwrap();

        let library = ProfileLibrary::new(dir.path());
        let profile = library.load("replai").unwrap();
        assert_eq!(profile, CharacterProfile::new("replAI", "A helpful AI assistant"));
        assert_eq!(library.list().unwrap(), vec!["replai".to_string()]);
        assert!(library.raw("replai").unwrap().contains("helpful"));
    }

    #[test]
    fn missing_or_malformed_profile_fails() {
        let dir = tempfile::tempdir().unwrap();
        let library = ProfileLibrary::new(dir.path());
        assert!(library.load("nobody").is_err());

        std::fs::write(dir.path().join("broken.toml"), "name = ").unwrap();
        assert!(library.load("broken").is_err());

        std::fs::write(dir.path().join("blank.toml"), "name = \" \"\ndescription = \"x\"\n")
            .unwrap();
        assert!(library.load("blank").is_err());
    }

    #[test]
    fn missing_directory_lists_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let library = ProfileLibrary::new(dir.path().join("absent"));
        assert!(library.list().unwrap().is_empty());
    }
}
