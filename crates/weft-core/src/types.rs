//! Identifier types shared by every Weft crate

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Error type for ID validation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IdValidationError {
    /// The ID string is empty
    Empty,
    /// The ID contains only whitespace
    WhitespaceOnly,
    /// The ID has leading or trailing whitespace
    LeadingTrailingWhitespace,
    /// The ID contains invalid characters
    InvalidCharacters,
    /// The topic pattern is not a valid glob
    InvalidPattern(String),
}

impl fmt::Display for IdValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Empty => write!(f, "ID cannot be empty"),
            Self::WhitespaceOnly => write!(f, "ID cannot be whitespace-only"),
            Self::LeadingTrailingWhitespace => {
                write!(f, "ID cannot have leading or trailing whitespace")
            }
            Self::InvalidCharacters => write!(
                f,
                "ID can only contain alphanumeric characters, hyphens, underscores, and dots"
            ),
            Self::InvalidPattern(reason) => write!(f, "invalid topic pattern: {}", reason),
        }
    }
}

impl std::error::Error for IdValidationError {}

fn validate(s: &str, extra: &[char]) -> Result<(), IdValidationError> {
    if s.is_empty() {
        return Err(IdValidationError::Empty);
    }
    if s.trim().is_empty() {
        return Err(IdValidationError::WhitespaceOnly);
    }
    if s != s.trim() {
        return Err(IdValidationError::LeadingTrailingWhitespace);
    }
    if !s
        .chars()
        .all(|c| c.is_alphanumeric() || c == '-' || c == '_' || c == '.' || extra.contains(&c))
    {
        return Err(IdValidationError::InvalidCharacters);
    }
    Ok(())
}

/// Unique identifier for a registered agent
///
/// Valid IDs are non-empty, carry no surrounding whitespace and use only
/// alphanumerics, hyphens, underscores and dots.
///
/// ```
/// use weft_core::AgentId;
///
/// assert!(AgentId::parse("researcher-1").is_ok());
/// assert!(AgentId::parse("").is_err());
/// assert!(AgentId::parse("agent/path").is_err());
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct AgentId(String);

impl AgentId {
    /// Parse and validate an agent ID
    pub fn parse(id: impl AsRef<str>) -> Result<Self, IdValidationError> {
        let s = id.as_ref();
        validate(s, &[])?;
        Ok(Self(s.to_string()))
    }

    /// Create an agent ID without validation, for trusted literals
    pub fn new_unchecked(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Get the agent ID as a string slice
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl FromStr for AgentId {
    type Err = IdValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for AgentId {
    type Error = IdValidationError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        validate(&s, &[])?;
        Ok(Self(s))
    }
}

impl From<AgentId> for String {
    fn from(id: AgentId) -> Self {
        id.0
    }
}

impl fmt::Display for AgentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier of one conversation session with an agent.
///
/// Sessions are derived from the run that owns them, e.g.
/// `pipeline-1a2b3c4d-stage2-writer`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionId(String);

impl SessionId {
    /// Create a session ID from any non-empty string
    pub fn new(id: impl Into<String>) -> Result<Self, IdValidationError> {
        let id = id.into();
        if id.trim().is_empty() {
            return Err(IdValidationError::Empty);
        }
        Ok(Self(id))
    }

    /// Session of a pipeline stage
    pub fn for_stage(run_id: &str, stage: usize, agent: &AgentId) -> Self {
        Self(format!("{run_id}-stage{stage}-{agent}"))
    }

    /// Session of a fork-join branch
    pub fn for_branch(run_id: &str, branch: usize, agent: &AgentId) -> Self {
        Self(format!("{run_id}-branch{branch}-{agent}"))
    }

    /// Session of a parallel task
    pub fn for_task(run_id: &str, task: usize, agent: &AgentId) -> Self {
        Self(format!("{run_id}-task{task}-{agent}"))
    }

    /// Session of a debate participant in one round
    pub fn for_round(run_id: &str, round: u32, agent: &AgentId) -> Self {
        Self(format!("{run_id}-round{round}-{agent}"))
    }

    /// Session for a single auxiliary call (condition, synthesis, merge)
    pub fn for_step(run_id: &str, step: &str, agent: &AgentId) -> Self {
        Self(format!("{run_id}-{step}-{agent}"))
    }

    /// Get the session ID as a string slice
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A concrete bus topic such as `workflow.restart`
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Topic(String);

impl Topic {
    /// Parse and validate a topic
    ///
    /// ```
    /// use weft_core::Topic;
    ///
    /// assert!(Topic::parse("workflow.restart").is_ok());
    /// assert!(Topic::parse("debate.*").is_err());
    /// ```
    pub fn parse(topic: impl AsRef<str>) -> Result<Self, IdValidationError> {
        let s = topic.as_ref();
        validate(s, &[])?;
        Ok(Self(s.to_string()))
    }

    /// Create a topic without validation, for trusted literals
    pub fn new_unchecked(topic: impl Into<String>) -> Self {
        Self(topic.into())
    }

    /// Get the topic as a string slice
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl FromStr for Topic {
    type Err = IdValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for Topic {
    type Error = IdValidationError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        validate(&s, &[])?;
        Ok(Self(s))
    }
}

impl From<Topic> for String {
    fn from(topic: Topic) -> Self {
        topic.0
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Glob pattern over topics, used by subscriptions and topic classes.
///
/// `*` matches any run of characters (dots included), `?` a single one.
#[derive(Debug, Clone)]
pub struct TopicPattern {
    raw: String,
    matcher: Matcher,
}

#[derive(Debug, Clone)]
enum Matcher {
    Exact,
    Glob(glob::Pattern),
}

impl TopicPattern {
    /// Parse a topic pattern
    ///
    /// ```
    /// use weft_core::{Topic, TopicPattern};
    ///
    /// let pattern = TopicPattern::parse("debate.*").unwrap();
    /// assert!(pattern.matches(&Topic::parse("debate.round1").unwrap()));
    /// assert!(!pattern.matches(&Topic::parse("swarm.vote").unwrap()));
    /// ```
    pub fn parse(pattern: impl AsRef<str>) -> Result<Self, IdValidationError> {
        let s = pattern.as_ref();
        validate(s, &['*', '?', '[', ']', '!'])?;
        let matcher = if s.contains(['*', '?', '[']) {
            Matcher::Glob(
                glob::Pattern::new(s)
                    .map_err(|e| IdValidationError::InvalidPattern(e.msg.to_string()))?,
            )
        } else {
            Matcher::Exact
        };
        Ok(Self {
            raw: s.to_string(),
            matcher,
        })
    }

    /// Pattern matching exactly one topic
    pub fn exact(topic: &Topic) -> Self {
        Self {
            raw: topic.as_str().to_string(),
            matcher: Matcher::Exact,
        }
    }

    /// Whether the topic matches this pattern
    pub fn matches(&self, topic: &Topic) -> bool {
        match &self.matcher {
            Matcher::Exact => self.raw == topic.as_str(),
            Matcher::Glob(pattern) => pattern.matches(topic.as_str()),
        }
    }

    /// Whether the pattern contains glob wildcards
    pub fn is_wildcard(&self) -> bool {
        matches!(self.matcher, Matcher::Glob(_))
    }

    /// Get the raw pattern
    pub fn as_str(&self) -> &str {
        &self.raw
    }
}

impl PartialEq for TopicPattern {
    fn eq(&self, other: &Self) -> bool {
        self.raw == other.raw
    }
}

impl Eq for TopicPattern {}

impl fmt::Display for TopicPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.raw)
    }
}

impl FromStr for TopicPattern {
    type Err = IdValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}
