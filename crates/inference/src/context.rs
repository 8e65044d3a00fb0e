//! Role-tagged conversation state and the chat templates that turn it into a
//! prompt.

use gemi_core::Family;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Turn {
    pub role: Role,
    pub content: String,
}

impl Turn {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::new(Role::System, content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, content)
    }
}

/// Prior turns plus retrieved memory snippets that condition a reply.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationContext {
    pub turns: Vec<Turn>,
    #[serde(default)]
    pub memories: Vec<String>,
}

impl ConversationContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_system(system: impl Into<String>) -> Self {
        Self {
            turns: vec![Turn::system(system)],
            memories: Vec::new(),
        }
    }

    pub fn push(&mut self, turn: Turn) -> &mut Self {
        self.turns.push(turn);
        self
    }

    pub fn user(&mut self, content: impl Into<String>) -> &mut Self {
        self.push(Turn::user(content))
    }

    pub fn assistant(&mut self, content: impl Into<String>) -> &mut Self {
        self.push(Turn::assistant(content))
    }

    pub fn remember(&mut self, snippet: impl Into<String>) -> &mut Self {
        self.memories.push(snippet.into());
        self
    }

    /// Nothing a template could render.
    pub fn is_empty(&self) -> bool {
        self.turns.iter().all(|t| t.content.trim().is_empty())
            && self.memories.iter().all(|m| m.trim().is_empty())
    }

    /// Remove the oldest non-system turn, never the most recent one.
    pub fn drop_oldest_turn(&mut self) -> bool {
        let last = self.turns.len().saturating_sub(1);
        match self.turns.iter().position(|t| t.role != Role::System) {
            Some(i) if i < last => {
                self.turns.remove(i);
                true
            }
            _ => false,
        }
    }

    fn system_text(&self) -> Option<String> {
        let parts: Vec<&str> = self
            .turns
            .iter()
            .filter(|t| t.role == Role::System)
            .map(|t| t.content.trim())
            .filter(|c| !c.is_empty())
            .collect();
        (!parts.is_empty()).then(|| parts.join("\n\n"))
    }

    fn notes(&self) -> Option<String> {
        let notes: Vec<String> = self
            .memories
            .iter()
            .map(|m| m.trim())
            .filter(|m| !m.is_empty())
            .map(|m| format!("- {m}"))
            .collect();
        (!notes.is_empty()).then(|| format!("Relevant notes:\n{}", notes.join("\n")))
    }

    /// System text and memory notes as one preamble.
    pub fn preamble(&self) -> Option<String> {
        let parts: Vec<String> = [self.system_text(), self.notes()].into_iter().flatten().collect();
        (!parts.is_empty()).then(|| parts.join("\n\n"))
    }
}

/// Prompt layout for a model family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChatTemplate {
    /// `<start_of_turn>role ... <end_of_turn>`, assistant written as `model`.
    Gemma,
    /// `<|im_start|>role ... <|im_end|>`.
    ChatMl,
}

impl ChatTemplate {
    pub fn for_family(family: Family) -> Self {
        match family {
            Family::Gemma => ChatTemplate::Gemma,
            Family::Llama => ChatTemplate::ChatMl,
        }
    }

    /// Render `context` and open the assistant's turn.
    pub fn render(&self, context: &ConversationContext) -> String {
        match self {
            ChatTemplate::Gemma => render_gemma(context),
            ChatTemplate::ChatMl => render_chatml(context),
        }
    }
}

fn render_gemma(context: &ConversationContext) -> String {
    let mut out = String::new();
    let mut preamble = context.preamble();
    for turn in context.turns.iter().filter(|t| t.role != Role::System) {
        let role = match turn.role {
            Role::Assistant => "model",
            _ => "user",
        };
        let content = match (turn.role, preamble.take()) {
            (Role::User, Some(pre)) => format!("{pre}\n\n{}", turn.content),
            (_, pre) => {
                preamble = pre;
                turn.content.clone()
            }
        };
        out.push_str(&format!("<start_of_turn>{role}\n{content}<end_of_turn>\n"));
    }
    if let Some(pre) = preamble {
        out.push_str(&format!("<start_of_turn>user\n{pre}<end_of_turn>\n"));
    }
    out.push_str("<start_of_turn>model\n");
    out
}

fn render_chatml(context: &ConversationContext) -> String {
    let mut out = String::new();
    if let Some(pre) = context.preamble() {
        out.push_str(&format!("<|im_start|>system\n{pre}<|im_end|>\n"));
    }
    for turn in context.turns.iter().filter(|t| t.role != Role::System) {
        let role = match turn.role {
            Role::Assistant => "assistant",
            _ => "user",
        };
        out.push_str(&format!("<|im_start|>{role}\n{}<|im_end|>\n", turn.content));
    }
    out.push_str("<|im_start|>assistant\n");
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn conversation() -> ConversationContext {
        let mut ctx = ConversationContext::with_system("You are Gemi.");
        ctx.user("Hi").assistant("Hello!").user("How was my week?");
        ctx.remember("Went hiking on Saturday").remember("  ");
        ctx
    }

    #[test]
    fn gemma_folds_system_and_notes_into_first_user_turn() {
        let prompt = ChatTemplate::Gemma.render(&conversation());
        assert_eq!(
            prompt,
            "<start_of_turn>user\nYou are Gemi.\n\nRelevant notes:\n- Went hiking on Saturday\n\nHi<end_of_turn>\n\
             <start_of_turn>model\nHello!<end_of_turn>\n\
             <start_of_turn>user\nHow was my week?<end_of_turn>\n\
             <start_of_turn>model\n"
        );
    }

    #[test]
    fn chatml_puts_preamble_in_a_system_block() {
        let prompt = ChatTemplate::ChatMl.render(&conversation());
        assert!(prompt.starts_with(
            "<|im_start|>system\nYou are Gemi.\n\nRelevant notes:\n- Went hiking on Saturday<|im_end|>\n<|im_start|>user\nHi<|im_end|>\n"
        ));
        assert!(prompt.ends_with("<|im_start|>assistant\n"));
    }

    #[test]
    fn system_only_context_still_renders_a_user_turn() {
        let ctx = ConversationContext::with_system("Be brief.");
        assert_eq!(
            ChatTemplate::Gemma.render(&ctx),
            "<start_of_turn>user\nBe brief.<end_of_turn>\n<start_of_turn>model\n"
        );
    }

    #[test]
    fn dropping_turns_keeps_system_and_latest() {
        let mut ctx = conversation();
        assert!(ctx.drop_oldest_turn());
        assert!(ctx.drop_oldest_turn());
        assert!(!ctx.drop_oldest_turn());
        assert_eq!(ctx.turns, vec![Turn::system("You are Gemi."), Turn::user("How was my week?")]);
    }

    #[test]
    fn blank_context_is_empty() {
        let mut ctx = ConversationContext::new();
        assert!(ctx.is_empty());
        ctx.user("   ");
        assert!(ctx.is_empty());
        ctx.remember("note");
        assert!(!ctx.is_empty());
    }

    #[test]
    fn roles_serialize_lowercase() {
        let turn: Turn = serde_json::from_str(r#"{"role":"assistant","content":"ok"}"#).unwrap();
        assert_eq!(turn, Turn::assistant("ok"));
        assert_eq!(serde_json::to_string(&Role::System).unwrap(), "\"system\"");
    }
}
