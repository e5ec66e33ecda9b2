//! Command and chat-argument types handed to protocol message factories.
//!
//! These are the shapes the protocol layer needs from the chat and command
//! subsystems, not those subsystems themselves.

use std::fmt;

/// Formatting applied to the text that follows it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChatStyle {
    Reset,
    Bold,
    Italic,
    Underline,
    Strikethrough,
    Obfuscated,
}

impl ChatStyle {
    /// Legacy formatting code following the section sign.
    pub fn code(&self) -> char {
        match self {
            ChatStyle::Reset => 'r',
            ChatStyle::Bold => 'l',
            ChatStyle::Italic => 'o',
            ChatStyle::Underline => 'n',
            ChatStyle::Strikethrough => 'm',
            ChatStyle::Obfuscated => 'k',
        }
    }
}

/// One piece of a chat line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChatPart {
    Text(String),
    Style(ChatStyle),
}

/// An ordered sequence of text and style markers.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChatArguments {
    parts: Vec<ChatPart>,
}

impl ChatArguments {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn text(mut self, text: impl Into<String>) -> Self {
        self.parts.push(ChatPart::Text(text.into()));
        self
    }

    pub fn style(mut self, style: ChatStyle) -> Self {
        self.parts.push(ChatPart::Style(style));
        self
    }

    pub fn append(&mut self, other: &ChatArguments) {
        self.parts.extend(other.parts.iter().cloned());
    }

    pub fn parts(&self) -> &[ChatPart] {
        &self.parts
    }

    pub fn is_empty(&self) -> bool {
        self.parts.is_empty()
    }

    /// Text with all styling dropped.
    pub fn plain(&self) -> String {
        self.parts
            .iter()
            .filter_map(|part| match part {
                ChatPart::Text(text) => Some(text.as_str()),
                ChatPart::Style(_) => None,
            })
            .collect()
    }

    /// Text with styles rendered as `§`-prefixed legacy codes.
    pub fn legacy(&self) -> String {
        let mut out = String::new();
        for part in &self.parts {
            match part {
                ChatPart::Text(text) => out.push_str(text),
                ChatPart::Style(style) => {
                    out.push('§');
                    out.push(style.code());
                }
            }
        }
        out
    }

    /// Whitespace-separated words of the plain text.
    pub fn words(&self) -> Vec<String> {
        self.plain().split_whitespace().map(str::to_string).collect()
    }
}

impl From<&str> for ChatArguments {
    fn from(text: &str) -> Self {
        Self::new().text(text)
    }
}

impl From<String> for ChatArguments {
    fn from(text: String) -> Self {
        Self::new().text(text)
    }
}

impl fmt::Display for ChatArguments {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.plain())
    }
}

/// A named command that can be invoked remotely.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    name: String,
    aliases: Vec<String>,
    usage: Option<String>,
}

impl Command {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            aliases: Vec::new(),
            usage: None,
        }
    }

    pub fn with_alias(mut self, alias: impl Into<String>) -> Self {
        self.aliases.push(alias.into());
        self
    }

    pub fn with_usage(mut self, usage: impl Into<String>) -> Self {
        self.usage = Some(usage.into());
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn aliases(&self) -> &[String] {
        &self.aliases
    }

    pub fn usage(&self) -> Option<&str> {
        self.usage.as_deref()
    }

    /// Whether `label` names this command or one of its aliases, ignoring case.
    pub fn matches(&self, label: &str) -> bool {
        self.name.eq_ignore_ascii_case(label)
            || self.aliases.iter().any(|a| a.eq_ignore_ascii_case(label))
    }
}
