use serde::{Deserialize, Serialize};

/// Author of a stored or assembled turn.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    User,
    Agent,
    System,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Agent => "agent",
            Self::System => "system",
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
            "user" => Ok(Self::User),
            // Older databases labelled replies "assistant".
            "agent" | "assistant" => Ok(Self::Agent),
            "system" => Ok(Self::System),
            other => Err(format!("unknown role: {other}")),
        }
    }
}

/// A persisted dialogue turn from the raw log.
///
/// `sequence_id` is assigned by the store on append and never changes.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct Message {
    pub user_id: String,
    pub role: Role,
    pub content: String,
    pub sequence_id: i64,
    pub created_at: String,
}

/// A `{role, content}` entry handed to the language model.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChatTurn {
    pub role: Role,
    pub content: String,
}

impl ChatTurn {
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

    pub fn agent(content: impl Into<String>) -> Self {
        Self::new(Role::Agent, content)
    }
}

impl From<&Message> for ChatTurn {
    fn from(m: &Message) -> Self {
        Self::new(m.role, m.content.clone())
    }
}

impl From<Message> for ChatTurn {
    fn from(m: Message) -> Self {
        Self {
            role: m.role,
            content: m.content,
        }
    }
}

/// Who produced a semantic record. Used to keep the agent from recalling itself.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum SourceTag {
    User,
    Agent,
    Custom(String),
}

impl SourceTag {
    pub fn as_str(&self) -> &str {
        match self {
            Self::User => "user",
            Self::Agent => "agent",
            Self::Custom(s) => s,
        }
    }
}

impl std::fmt::Display for SourceTag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<&str> for SourceTag {
    fn from(s: &str) -> Self {
        match s {
            "user" => Self::User,
            "agent" | "assistant" => Self::Agent,
            other => Self::Custom(other.to_string()),
        }
    }
}

impl Serialize for SourceTag {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for SourceTag {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Ok(Self::from(s.as_str()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn role_roundtrip_str() {
        for role in [Role::User, Role::Agent, Role::System] {
            assert_eq!(role.as_str().parse::<Role>().unwrap(), role);
        }
    }

    #[test]
    fn role_accepts_legacy_assistant() {
        assert_eq!("assistant".parse::<Role>().unwrap(), Role::Agent);
    }

    #[test]
    fn role_rejects_unknown() {
        let err = "narrator".parse::<Role>().unwrap_err();
        assert!(err.contains("narrator"));
    }

    #[test]
    fn role_serializes_snake_case() {
        assert_eq!(serde_json::to_string(&Role::Agent).unwrap(), "\"agent\"");
    }

    #[test]
    fn chat_turn_from_message() {
        let msg = Message {
            user_id: "u1".into(),
            role: Role::User,
            content: "hi".into(),
            sequence_id: 1,
            created_at: "2024-01-01T00:00:00Z".into(),
        };
        let turn = ChatTurn::from(&msg);
        assert_eq!(turn, ChatTurn::user("hi"));
    }

    #[test]
    fn source_tag_parsing() {
        assert_eq!(SourceTag::from("user"), SourceTag::User);
        assert_eq!(SourceTag::from("agent"), SourceTag::Agent);
        assert_eq!(SourceTag::from("chat"), SourceTag::Custom("chat".into()));
        assert_eq!(SourceTag::Custom("doc".into()).as_str(), "doc");
    }

    #[test]
    fn source_tag_serde_as_string() {
        let json = serde_json::to_string(&SourceTag::Agent).unwrap();
        assert_eq!(json, "\"agent\"");
        let parsed: SourceTag = serde_json::from_str("\"chat\"").unwrap();
        assert_eq!(parsed, SourceTag::Custom("chat".into()));
    }
}
