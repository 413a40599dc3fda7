use std::{error::Error, path::PathBuf, time::Duration};

use anyhow::anyhow;
use clap::Parser;
use component::chat::ChatSession;
use llm::{ollama::OllamaBackend, ChatBackend};
use sys::{
    chat_log::ChatLogStore,
    llm::SamplingOptions,
    prompt::{PromptAssembler, SystemPlacement, DEFAULT_HISTORY_WINDOW},
    ProfileLibrary,
};

mod component;
mod debug_tool;
mod llm;
mod sys;

#[derive(Debug, clap::Parser)]
struct Args {
    #[arg(long, short, default_value = "replai.toml")]
    project_path: String,

    /// answer with the echo backend instead of the inference server
    #[arg(long)]
    debug_llm: bool,

    #[arg(long)]
    list_models: bool,

    #[arg(long)]
    list_chats: bool,

    #[arg(long)]
    list_characters: bool,
}

#[derive(Debug, Clone, serde::Deserialize)]
struct Project {
    #[serde(default)]
    model: String,
    assistant: String,
    user: String,
    chat: String,
    #[serde(default = "default_true")]
    new_chat: bool,
    #[serde(default)]
    chats_dir: String,
    #[serde(default)]
    characters_dir: String,
    #[serde(default)]
    templates_dir: String,
    #[serde(default)]
    template: String,
    #[serde(default)]
    history_window: usize,
    #[serde(default)]
    system_placement: SystemPlacement,
    #[serde(default)]
    backend: BackendOptions,
    #[serde(default)]
    sampling: SamplingOptions,
}

#[derive(Debug, Clone, serde::Deserialize)]
struct BackendOptions {
    #[serde(default)]
    base_url: String,
    #[serde(default = "default_true")]
    stream: bool,
    #[serde(default)]
    request_timeout_secs: Option<u64>,
    #[serde(default)]
    connect_timeout_secs: u64,
}

impl Default for BackendOptions {
    fn default() -> Self {
        Self {
            base_url: String::new(),
            stream: true,
            request_timeout_secs: None,
            connect_timeout_secs: 0,
        }
    }
}

fn default_true() -> bool {
    true
}

impl Project {
    fn load(path: &str) -> anyhow::Result<Self> {
        let text = std::fs::read_to_string(path)
            .map_err(|_| anyhow!("project file `{}` not found", path))?;
        let mut project: Project = toml::from_str(&text)?;
        project.fill_default_value();
        Ok(project)
    }

    fn fill_default_value(&mut self) {
        if self.chats_dir.is_empty() {
            self.chats_dir = "chats".to_string();
        }
        if self.characters_dir.is_empty() {
            self.characters_dir = "characters".to_string();
        }
        if self.templates_dir.is_empty() {
            self.templates_dir = "templates".to_string();
        }
        if self.history_window == 0 {
            self.history_window = DEFAULT_HISTORY_WINDOW;
        }
        if self.backend.base_url.is_empty() {
            self.backend.base_url = llm::ollama::DEFAULT_BASE_URL.to_string();
        }
        if self.backend.connect_timeout_secs == 0 {
            self.backend.connect_timeout_secs = 10;
        }
    }

    fn template_path(&self) -> Option<PathBuf> {
        if self.template.is_empty() {
            None
        } else {
            Some(PathBuf::from(&self.templates_dir).join(format!("{}.hbs", self.template)))
        }
    }

    fn assembler(&self) -> anyhow::Result<PromptAssembler> {
        let assembler = match self.template_path() {
            Some(path) => PromptAssembler::from_file(path)?,
            None => PromptAssembler::builtin()?,
        };
        Ok(assembler
            .with_history_window(self.history_window)
            .with_placement(self.system_placement))
    }

    fn backend(&self, debug_llm: bool) -> anyhow::Result<Box<dyn ChatBackend>> {
        if debug_llm {
            return Ok(Box::new(debug_tool::EchoBackend));
        }
        let backend = OllamaBackend::new(
            self.backend.base_url.clone(),
            self.backend.request_timeout_secs.map(Duration::from_secs),
            Duration::from_secs(self.backend.connect_timeout_secs),
        )?;
        Ok(Box::new(backend))
    }
}

fn main() -> Result<(), Box<dyn Error>> {
    env_logger::init();
    let cli = Args::parse();
    let project = Project::load(&cli.project_path)?;

    let backend = project.backend(cli.debug_llm)?;
    let store = ChatLogStore::new(&project.chats_dir);
    let characters = ProfileLibrary::new(&project.characters_dir);

    if cli.list_models {
        for model in backend.list_models()? {
            println!("{model}");
        }
        return Ok(());
    }
    if cli.list_chats {
        for chat in store.list()? {
            println!("{chat}");
        }
        return Ok(());
    }
    if cli.list_characters {
        for name in characters.list()? {
            println!("== {name}\n{}", characters.raw(&name)?);
        }
        return Ok(());
    }

    let ai = characters.load(&project.assistant)?;
    let user = characters.load(&project.user)?;
    let assembler = project.assembler()?;

    let chat = if project.new_chat {
        store.create(&project.chat)?
    } else {
        let path = store.path_for(&project.chat);
        if !path.exists() {
            return Err(anyhow!("chat `{}` not found", path.display()).into());
        }
        path
    };

    let model = if project.model.is_empty() {
        backend
            .list_models()?
            .into_iter()
            .next()
            .ok_or(anyhow!("no models available"))?
    } else {
        project.model.clone()
    };

    let session = ChatSession::new(store, chat, assembler, backend, ai, user)?
        .with_model(model)
        .with_stream(project.backend.stream)
        .with_sampling(project.sampling);

    let app = component::App::new(session);

    let res = app.run_loop();

    if let Err(err) = res {
        println!("{err:?}");
    }

    Ok(())
}
