//! Prompt assembly for judge evaluations.
//!
//! Merges a model output, optional references, and task-specific fields into
//! a single rendering context, then renders it either as flat text or as a
//! chat-turn sequence. Provider-agnostic.

use std::sync::Arc;

use tracing::warn;

use crate::gateway::Message;

// =============================================================================
// Rendering context
// =============================================================================

/// Field names that the context itself defines. Task inputs may not shadow
/// them: a colliding task field is dropped with a warning.
pub const RESERVED_FIELDS: &[&str] = &["lm_output", "references"];

/// A field value available to templates.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldValue {
    Text(String),
    List(Vec<String>),
}

impl FieldValue {
    /// Textual form used when substituting into a template.
    /// Lists render one element per line.
    pub fn as_text(&self) -> String {
        match self {
            FieldValue::Text(s) => s.clone(),
            FieldValue::List(items) => items.join("\n"),
        }
    }
}

/// The merged rendering context for one evaluation instance:
/// `{lm_output, references, **task_inputs}`, in insertion order.
#[derive(Debug, Clone, Default)]
pub struct RenderContext {
    fields: Vec<(String, FieldValue)>,
}

impl RenderContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build the context for a scored instance. Reserved keys are inserted
    /// first; task fields with reserved names are dropped, not silently
    /// shadowed.
    pub fn for_instance<'a, I>(lm_output: &str, references: &[String], task_inputs: I) -> Self
    where
        I: IntoIterator<Item = (&'a String, &'a String)>,
    {
        let mut ctx = Self::new();
        ctx.insert("lm_output", FieldValue::Text(lm_output.to_string()));
        ctx.insert("references", FieldValue::List(references.to_vec()));
        for (key, value) in task_inputs {
            if RESERVED_FIELDS.contains(&key.as_str()) {
                warn!(field = %key, "task input shadows a reserved prompt field, dropping");
                continue;
            }
            ctx.insert(key.clone(), FieldValue::Text(value.clone()));
        }
        ctx
    }

    /// Insert a field. The first value for a key wins.
    pub fn insert(&mut self, key: impl Into<String>, value: FieldValue) {
        let key = key.into();
        if self.fields.iter().any(|(k, _)| *k == key) {
            return;
        }
        self.fields.push((key, value));
    }

    pub fn get(&self, key: &str) -> Option<&FieldValue> {
        self.fields.iter().find(|(k, _)| k == key).map(|(_, v)| v)
    }

    /// Iterate fields in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &FieldValue)> {
        self.fields.iter().map(|(k, v)| (k.as_str(), v))
    }
}

// =============================================================================
// Template capability
// =============================================================================

/// A prompt template: the rendering engine is an external collaborator, the
/// core only needs `render`.
pub trait PromptTemplate: Send + Sync {
    fn render(&self, ctx: &RenderContext) -> String;
}

/// Template with `{field}` placeholders substituted from the context.
#[derive(Debug, Clone)]
pub struct PlaceholderTemplate {
    template: String,
}

impl PlaceholderTemplate {
    pub fn new(template: impl Into<String>) -> Self {
        Self {
            template: template.into(),
        }
    }
}

impl PromptTemplate for PlaceholderTemplate {
    fn render(&self, ctx: &RenderContext) -> String {
        let mut out = self.template.clone();
        for (key, value) in ctx.iter() {
            out = out.replace(&format!("{{{key}}}"), &value.as_text());
        }
        out
    }
}

// =============================================================================
// Assembly
// =============================================================================

/// How to present the rendered prompt to the judge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PromptMode {
    /// A single flat string.
    Text,
    /// A chat-turn sequence: optional system turn, then one user turn.
    Chat,
}

/// System message for chat-mode prompts: a literal string or a template
/// rendered against the same context as the user turn.
#[derive(Clone)]
pub enum SystemMessage {
    Literal(String),
    Template(Arc<dyn PromptTemplate>),
}

impl SystemMessage {
    fn render(&self, ctx: &RenderContext) -> String {
        match self {
            SystemMessage::Literal(s) => s.clone(),
            SystemMessage::Template(t) => t.render(ctx),
        }
    }
}

impl std::fmt::Debug for SystemMessage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SystemMessage::Literal(s) => f.debug_tuple("Literal").field(s).finish(),
            SystemMessage::Template(_) => f.debug_tuple("Template").field(&"..").finish(),
        }
    }
}

/// A rendered prompt, resolved to its shape exactly once at assembly time.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub enum RenderedPrompt {
    Text(String),
    Chat(Vec<Message>),
}

impl RenderedPrompt {
    /// Flat-text view for display and audit records.
    pub fn display_text(&self) -> String {
        match self {
            RenderedPrompt::Text(s) => s.clone(),
            RenderedPrompt::Chat(messages) => messages
                .iter()
                .map(|m| format!("{:?}: {}", m.role, m.content))
                .collect::<Vec<_>>()
                .join("\n"),
        }
    }
}

/// Render a template against a context in the requested mode.
///
/// In chat mode the optional system turn comes first, followed by exactly
/// one user turn holding the rendered template output. The system message
/// is ignored in text mode.
pub fn assemble_prompt(
    template: &dyn PromptTemplate,
    ctx: &RenderContext,
    mode: PromptMode,
    system: Option<&SystemMessage>,
) -> RenderedPrompt {
    let rendered = template.render(ctx);
    match mode {
        PromptMode::Text => RenderedPrompt::Text(rendered),
        PromptMode::Chat => {
            let mut messages = Vec::with_capacity(2);
            if let Some(system) = system {
                messages.push(Message::system(system.render(ctx)));
            }
            messages.push(Message::user(rendered));
            RenderedPrompt::Chat(messages)
        }
    }
}

// =============================================================================
// TESTS
// =============================================================================
