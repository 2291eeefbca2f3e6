//! One exchange between the user and the assistant.

/// A completed user/assistant exchange within a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatTurn {
    pub user: String,
    pub assistant: String,
}

impl ChatTurn {
    pub fn new(user: impl Into<String>, assistant: impl Into<String>) -> Self {
        Self {
            user: user.into(),
            assistant: assistant.into(),
        }
    }

    /// Lines appended to the session's history log, in order.
    pub fn history_lines(&self) -> [String; 2] {
        [
            format!("User: {}", self.user),
            format!("Chatbot: {}", self.assistant),
        ]
    }

    /// Text that gets embedded and stored in the vector index.
    pub fn combined_text(&self) -> String {
        format!("{}{}", self.user, self.assistant)
    }
}
