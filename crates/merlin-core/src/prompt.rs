use serde::{Deserialize, Serialize};

/// Author of a prompt part or stored message.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    System,
    Developer,
    User,
    Assistant,
    Tool,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::System => "system",
            Self::Developer => "developer",
            Self::User => "user",
            Self::Assistant => "assistant",
            Self::Tool => "tool",
        }
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Role {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "system" => Ok(Self::System),
            "developer" => Ok(Self::Developer),
            "user" => Ok(Self::User),
            "assistant" => Ok(Self::Assistant),
            "tool" => Ok(Self::Tool),
            other => Err(format!("unknown role: {other}")),
        }
    }
}

/// Named slot of the prompt. Order of declaration is the order sent to the backend.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SectionKind {
    System,
    Developer,
    Story,
    Character,
    History,
    UserInput,
    Task,
}

/// Which end of a section survives when it is shortened.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum KeepEnd {
    Head,
    Tail,
}

impl SectionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::System => "system",
            Self::Developer => "developer",
            Self::Story => "story",
            Self::Character => "character",
            Self::History => "history",
            Self::UserInput => "user_input",
            Self::Task => "task",
        }
    }

    /// Role used for plain text placed in this section.
    pub fn default_role(&self) -> Role {
        match self {
            Self::System | Self::Story | Self::Character => Role::System,
            Self::Developer | Self::Task => Role::Developer,
            Self::History | Self::UserInput => Role::User,
        }
    }

    /// History keeps its most recent turns; everything else keeps its opening.
    pub fn keep_end(&self) -> KeepEnd {
        match self {
            Self::History => KeepEnd::Tail,
            _ => KeepEnd::Head,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PromptPart {
    pub role: Role,
    pub content: String,
}

impl PromptPart {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }

    pub fn char_count(&self) -> usize {
        self.content.chars().count()
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PromptSection {
    pub kind: SectionKind,
    pub parts: Vec<PromptPart>,
}

impl PromptSection {
    pub fn new(kind: SectionKind) -> Self {
        Self {
            kind,
            parts: Vec::new(),
        }
    }

    /// Single-part section using the kind's default role.
    pub fn text(kind: SectionKind, content: impl Into<String>) -> Self {
        Self {
            kind,
            parts: vec![PromptPart::new(kind.default_role(), content)],
        }
    }

    pub fn with_part(mut self, role: Role, content: impl Into<String>) -> Self {
        self.parts.push(PromptPart::new(role, content));
        self
    }

    pub fn char_count(&self) -> usize {
        self.parts.iter().map(PromptPart::char_count).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.parts.iter().all(|p| p.content.is_empty())
    }
}

/// Ordered, sectioned representation of everything sent to the backend for one turn.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PromptStack {
    sections: Vec<PromptSection>,
}

impl PromptStack {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, section: PromptSection) -> Self {
        self.push(section);
        self
    }

    pub fn push(&mut self, section: PromptSection) {
        self.sections.push(section);
    }

    pub fn sections(&self) -> &[PromptSection] {
        &self.sections
    }

    pub fn sections_mut(&mut self) -> &mut [PromptSection] {
        &mut self.sections
    }

    pub fn section(&self, kind: SectionKind) -> Option<&PromptSection> {
        self.sections.iter().find(|s| s.kind == kind)
    }

    /// All parts in send order.
    pub fn parts(&self) -> impl Iterator<Item = &PromptPart> {
        self.sections.iter().flat_map(|s| s.parts.iter())
    }

    pub fn char_count(&self) -> usize {
        self.sections.iter().map(PromptSection::char_count).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.sections.iter().all(PromptSection::is_empty)
    }

    /// True when some non-empty part carries user or instruction content.
    pub fn has_instruction(&self) -> bool {
        self.parts()
            .any(|p| matches!(p.role, Role::User | Role::System) && !p.content.is_empty())
    }
}
