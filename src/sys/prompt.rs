use std::path::Path;

use anyhow::{anyhow, Context};
use handlebars::Handlebars;

use super::llm::{ChatTurn, Role};
use super::CharacterProfile;

const SYSTEM_TEMPLATE: &str = "system";

pub const DEFAULT_SYSTEM_TEMPLATE: &str = include_str!("../../templates/system_prompt.hbs");

pub const DEFAULT_HISTORY_WINDOW: usize = 1000;

/// Where the system instruction goes relative to the history.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SystemPlacement {
    BeforeHistory,
    #[default]
    AfterHistory,
}

pub struct PromptAssembler {
    registry: Handlebars<'static>,
    history_window: usize,
    placement: SystemPlacement,
}

impl PromptAssembler {
    pub fn new(template: &str) -> anyhow::Result<Self> {
        let mut registry = Handlebars::new();
        registry.register_escape_fn(handlebars::no_escape);
        registry.set_strict_mode(true);
        registry
            .register_template_string(SYSTEM_TEMPLATE, template)
            .map_err(|e| anyhow!("invalid system prompt template: {e}"))?;

        Ok(Self {
            registry,
            history_window: DEFAULT_HISTORY_WINDOW,
            placement: SystemPlacement::default(),
        })
    }

    pub fn builtin() -> anyhow::Result<Self> {
        Self::new(DEFAULT_SYSTEM_TEMPLATE)
    }

    pub fn from_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let template = std::fs::read_to_string(path)
            .map_err(|_| anyhow!("template file `{}` not found", path.display()))?;
        Self::new(&template).with_context(|| format!("load template `{}`", path.display()))
    }

    pub fn with_history_window(mut self, history_window: usize) -> Self {
        self.history_window = history_window;
        self
    }

    pub fn with_placement(mut self, placement: SystemPlacement) -> Self {
        self.placement = placement;
        self
    }

    pub fn system_instruction(
        &self,
        ai: &CharacterProfile,
        user: &CharacterProfile,
        time: &str,
    ) -> anyhow::Result<String> {
        let data = serde_json::json!({
            "ai": ai,
            "user": user,
            "time": time,
        });
        let rendered = self
            .registry
            .render(SYSTEM_TEMPLATE, &data)
            .map_err(|e| anyhow!("render system prompt err:{e}"))?;
        Ok(rendered.trim_end().to_string())
    }

    /// Builds the outbound message list: the last `history_window` turns plus
    /// one system instruction, placed according to the configured policy.
    /// Stamped turns are sent as `[dd/mm/yyyy, HH:MM] - name: content`.
    pub fn assemble(
        &self,
        history: &[ChatTurn],
        ai: &CharacterProfile,
        user: &CharacterProfile,
        time: &str,
    ) -> anyhow::Result<Vec<ChatTurn>> {
        let system = ChatTurn::system(self.system_instruction(ai, user, time)?);
        let window = window(history, self.history_window)
            .iter()
            .map(|turn| render_turn(turn, ai, user));

        let mut messages = Vec::with_capacity(history.len().min(self.history_window) + 1);
        match self.placement {
            SystemPlacement::BeforeHistory => {
                messages.push(system);
                messages.extend(window);
            }
            SystemPlacement::AfterHistory => {
                messages.extend(window);
                messages.push(system);
            }
        }

        log::debug!("prompts:\n{:#?}", messages);

        Ok(messages)
    }
}

fn render_turn(turn: &ChatTurn, ai: &CharacterProfile, user: &CharacterProfile) -> ChatTurn {
    let Some(timestamp) = &turn.timestamp else {
        return turn.clone();
    };
    let name = match turn.role {
        Role::Assistant => ai.name.as_str(),
        Role::User => user.name.as_str(),
        Role::System => "system",
    };
    ChatTurn::new(turn.role, format!("[{timestamp}] - {name}: {}", turn.content))
}

/// The last `n` entries of `history`, in order.
pub fn window<T>(history: &[T], n: usize) -> &[T] {
    &history[history.len().saturating_sub(n)..]
}

#[cfg(test)]
mod tests {
    use super::*;

    fn profiles() -> (CharacterProfile, CharacterProfile) {
        (
            CharacterProfile::new("replAI", "A helpful AI assistant"),
            CharacterProfile::new("Joe", "A curious <student> & gamer"),
        )
    }

    #[test]
    fn window_keeps_most_recent_in_order() {
        let history = vec![
            ChatTurn::user("one"),
            ChatTurn::assistant("two"),
            ChatTurn::user("three"),
        ];
        assert_eq!(
            window(&history, 2),
            &[ChatTurn::assistant("two"), ChatTurn::user("three")]
        );
        assert_eq!(window(&history, 10).len(), 3);
        assert!(window(&history, 0).is_empty());
    }

    #[test]
    fn default_template_fills_both_profiles() {
        let (ai, user) = profiles();
        let assembler = PromptAssembler::builtin().unwrap();
        let text = assembler
            .system_instruction(&ai, &user, "07/03/2024, 09:05")
            .unwrap();

        assert!(text.starts_with(
            "You are \"replAI\", who is \"A helpful AI assistant\". You are in a DM chat with \"Joe\""
        ));
        assert!(text.contains("A curious <student> & gamer"));
        assert!(text.contains("The time right now is 07/03/2024, 09:05."));
        assert!(!text.contains("{{"));
        assert_eq!(
            text,
            assembler
                .system_instruction(&ai, &user, "07/03/2024, 09:05")
                .unwrap()
        );
    }

    #[test]
    fn placement_policy_orders_system_instruction() {
        let (ai, user) = profiles();
        let history = vec![ChatTurn::user("a"), ChatTurn::assistant("b"), ChatTurn::user("c")];

        let after = PromptAssembler::new("{{ai.name}} talks to {{user.name}} at {{time}}")
            .unwrap()
            .with_history_window(2)
            .assemble(&history, &ai, &user, "now")
            .unwrap();
        assert_eq!(
            after,
            vec![
                ChatTurn::assistant("b"),
                ChatTurn::user("c"),
                ChatTurn::system("replAI talks to Joe at now"),
            ]
        );

        let before = PromptAssembler::new("{{ai.name}}")
            .unwrap()
            .with_placement(SystemPlacement::BeforeHistory)
            .assemble(&history, &ai, &user, "now")
            .unwrap();
        assert_eq!(before[0], ChatTurn::system("replAI"));
        assert_eq!(&before[1..], history.as_slice());
    }

    #[test]
    fn stamped_turns_carry_time_and_sender() {
        let (ai, user) = profiles();
        let history = vec![
            ChatTurn::user("[06/03/2024, 20:00] - Joe: old"),
            ChatTurn::user("new").with_timestamp("07/03/2024, 09:05"),
            ChatTurn::assistant("hi").with_timestamp("07/03/2024, 09:06"),
        ];
        let messages = PromptAssembler::new("{{ai.name}}")
            .unwrap()
            .assemble(&history, &ai, &user, "now")
            .unwrap();
        assert_eq!(
            messages,
            vec![
                ChatTurn::user("[06/03/2024, 20:00] - Joe: old"),
                ChatTurn::user("[07/03/2024, 09:05] - Joe: new"),
                ChatTurn::assistant("[07/03/2024, 09:06] - replAI: hi"),
                ChatTurn::system("replAI"),
            ]
        );
        assert!(messages.iter().all(|m| m.timestamp.is_none()));
    }

    #[test]
    fn bad_templates_fail() {
        assert!(PromptAssembler::new("{{#if ai.name}}unclosed").is_err());

        let (ai, user) = profiles();
        let unknown = PromptAssembler::new("{{ai.age}}").unwrap();
        assert!(unknown.system_instruction(&ai, &user, "now").is_err());
    }

    #[test]
    fn template_loads_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("short.hbs");
        std::fs::write(&path, "Be {{ai.name}}.\n").unwrap();
        let (ai, user) = profiles();
        let assembler = PromptAssembler::from_file(&path).unwrap();
        assert_eq!(assembler.system_instruction(&ai, &user, "now").unwrap(), "Be replAI.");
        assert!(PromptAssembler::from_file(dir.path().join("missing.hbs")).is_err());
    }
}
