//! Chat prompt formatting and reasoning extraction.
//!
//! Templates are recognised by their control markers (or a short format name)
//! rather than executed. The template in force is the first usable one of:
//! request override, session override, model default. An override that cannot
//! be recognised falls back to the next candidate.

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

use crate::config::ReasoningFormat;

const THINK_OPEN: &str = "<think>";
const THINK_CLOSE: &str = "</think>";

#[derive(Error, Debug, PartialEq, Eq)]
pub enum ChatError {
    #[error("no chat messages given")]
    NoMessages,

    #[error("no usable chat template")]
    NoTemplate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    System,
    User,
    Assistant,
}

impl ChatRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChatRole::System => "system",
            ChatRole::User => "user",
            ChatRole::Assistant => "assistant",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: ChatRole,
    pub content: String,
}

impl ChatMessage {
    pub fn new(role: ChatRole, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }
}

/// Prompt layout of a model family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChatFormat {
    ChatMl,
    Llama3,
    Gemma,
    Llama2,
}

impl ChatFormat {
    /// Recognise a template by its control markers.
    pub fn detect(template: &str) -> Option<Self> {
        if template.contains("<|start_header_id|>") && template.contains("<|eot_id|>") {
            Some(ChatFormat::Llama3)
        } else if template.contains("<|im_start|>") && template.contains("<|im_end|>") {
            Some(ChatFormat::ChatMl)
        } else if template.contains("<start_of_turn>") && template.contains("<end_of_turn>") {
            Some(ChatFormat::Gemma)
        } else if template.contains("[INST]") {
            Some(ChatFormat::Llama2)
        } else {
            None
        }
    }

    /// Short names accepted in place of a full template.
    pub fn from_name(name: &str) -> Option<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            "chatml" => Some(ChatFormat::ChatMl),
            "llama3" => Some(ChatFormat::Llama3),
            "gemma" => Some(ChatFormat::Gemma),
            "llama2" | "mistral" => Some(ChatFormat::Llama2),
            _ => None,
        }
    }

    fn parse(template: &str) -> Option<Self> {
        Self::from_name(template).or_else(|| Self::detect(template))
    }

    /// Marker that closes one turn.
    pub fn end_of_turn(&self) -> &'static str {
        match self {
            ChatFormat::ChatMl => "<|im_end|>",
            ChatFormat::Llama3 => "<|eot_id|>",
            ChatFormat::Gemma => "<end_of_turn>",
            ChatFormat::Llama2 => "</s>",
        }
    }

    pub fn render(&self, messages: &[ChatMessage], add_generation_prompt: bool) -> String {
        let mut out = String::new();
        match self {
            ChatFormat::ChatMl => {
                for m in messages {
                    out.push_str(&format!("<|im_start|>{}\n{}<|im_end|>\n", m.role.as_str(), m.content));
                }
                if add_generation_prompt {
                    out.push_str("<|im_start|>assistant\n");
                }
            }
            ChatFormat::Llama3 => {
                for m in messages {
                    out.push_str(&format!(
                        "<|start_header_id|>{}<|end_header_id|>\n\n{}<|eot_id|>",
                        m.role.as_str(),
                        m.content
                    ));
                }
                if add_generation_prompt {
                    out.push_str("<|start_header_id|>assistant<|end_header_id|>\n\n");
                }
            }
            ChatFormat::Gemma => {
                // No system role: system text is prepended to the next user turn.
                let mut system = String::new();
                for m in messages {
                    match m.role {
                        ChatRole::System => {
                            system.push_str(&m.content);
                            system.push_str("\n\n");
                        }
                        ChatRole::User => {
                            out.push_str(&format!(
                                "<start_of_turn>user\n{}{}<end_of_turn>\n",
                                std::mem::take(&mut system),
                                m.content
                            ));
                        }
                        ChatRole::Assistant => {
                            out.push_str(&format!("<start_of_turn>model\n{}<end_of_turn>\n", m.content));
                        }
                    }
                }
                if add_generation_prompt {
                    out.push_str("<start_of_turn>model\n");
                }
            }
            ChatFormat::Llama2 => {
                let mut system = None;
                for m in messages {
                    match m.role {
                        ChatRole::System => system = Some(m.content.as_str()),
                        ChatRole::User => {
                            out.push_str("[INST] ");
                            if let Some(sys) = system.take() {
                                out.push_str(&format!("<<SYS>>\n{sys}\n<</SYS>>\n\n"));
                            }
                            out.push_str(&format!("{} [/INST]", m.content));
                        }
                        ChatRole::Assistant => out.push_str(&format!(" {} </s>", m.content)),
                    }
                }
            }
        }
        out
    }
}

/// Where the template in force came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TemplateSource {
    Request,
    Session,
    Model,
}

/// Candidate templates, highest precedence first.
#[derive(Debug, Clone, Copy, Default)]
pub struct ChatTemplates<'a> {
    pub request: Option<&'a str>,
    pub session: Option<&'a str>,
    pub model: Option<&'a str>,
}

impl ChatTemplates<'_> {
    fn resolve(&self) -> Option<(ChatFormat, TemplateSource)> {
        let candidates = [
            (TemplateSource::Request, self.request),
            (TemplateSource::Session, self.session),
            (TemplateSource::Model, self.model),
        ];
        for (source, template) in candidates {
            let Some(template) = template.filter(|t| !t.trim().is_empty()) else {
                continue;
            };
            match ChatFormat::parse(template) {
                Some(format) => return Some((format, source)),
                None => warn!(?source, "Unrecognised chat template, falling back"),
            }
        }
        None
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FormattedChat {
    pub prompt: String,
    pub format: ChatFormat,
    pub source: TemplateSource,
    /// Stop sequences the caller should add to the completion request.
    pub stop: Vec<String>,
    /// The prompt already opens a thinking block.
    pub thinking_open: bool,
}

/// Render `messages` with the first usable template.
pub fn format_chat(
    messages: &[ChatMessage],
    templates: ChatTemplates<'_>,
    reasoning: ReasoningFormat,
    add_generation_prompt: bool,
) -> Result<FormattedChat, ChatError> {
    if messages.is_empty() {
        return Err(ChatError::NoMessages);
    }
    let (format, source) = templates.resolve().ok_or(ChatError::NoTemplate)?;

    let mut prompt = format.render(messages, add_generation_prompt);
    let thinking_open = add_generation_prompt && reasoning == ReasoningFormat::Deepseek;
    if thinking_open {
        prompt.push_str(THINK_OPEN);
        prompt.push('\n');
    }
    debug!(?format, ?source, messages = messages.len(), "Formatted chat");
    Ok(FormattedChat {
        prompt,
        format,
        source,
        stop: vec![format.end_of_turn().to_string()],
        thinking_open,
    })
}

/// Split generated text into (reasoning, answer).
///
/// `Auto` only extracts an explicit `<think>` block at the start. `Deepseek` also
/// treats text before a lone `</think>` as reasoning, since its prompts open the
/// block themselves. An unterminated block is all reasoning.
pub fn split_reasoning(text: &str, format: ReasoningFormat) -> (Option<String>, String) {
    if format == ReasoningFormat::None {
        return (None, text.to_string());
    }
    let trimmed = text.trim_start();
    let body = if let Some(rest) = trimmed.strip_prefix(THINK_OPEN) {
        rest
    } else if format == ReasoningFormat::Deepseek && text.contains(THINK_CLOSE) {
        text
    } else {
        return (None, text.to_string());
    };

    match body.find(THINK_CLOSE) {
        Some(end) => (
            Some(body[..end].trim().to_string()),
            body[end + THINK_CLOSE.len()..].trim_start().to_string(),
        ),
        None => (Some(body.trim().to_string()), String::new()),
    }
}
