use serde::{Deserialize, Serialize};
use std::fmt;

/// Operator-declared run state, persisted in the `intent` file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Intent {
    Serving,
    Stopped,
}

impl Intent {
    pub fn as_str(&self) -> &'static str {
        match self {
            Intent::Serving => "SERVING",
            Intent::Stopped => "STOPPED",
        }
    }

    /// Parses the persisted text. Anything unrecognised is no intent at all,
    /// which callers treat the same way as `Stopped`.
    pub fn parse(text: &str) -> Option<Intent> {
        match text.trim() {
            "SERVING" => Some(Intent::Serving),
            "STOPPED" => Some(Intent::Stopped),
            _ => None,
        }
    }
}

impl fmt::Display for Intent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
