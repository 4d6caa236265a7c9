//! Une protocol action names.

use std::fmt;

/// Action carried by an envelope.
///
/// Requests (`List`, `Read`, `Change`, `Execute`) flow to the ExEn, the
/// remaining variants are replies and notifications flowing back.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Action {
    List,
    Read,
    Change,
    Execute,
    Readed,
    Changed,
    Listed,
    Error,
    Added,
    Removed,
}

impl Action {
    pub const ALL: [Action; 10] = [
        Action::List,
        Action::Read,
        Action::Change,
        Action::Execute,
        Action::Readed,
        Action::Changed,
        Action::Listed,
        Action::Error,
        Action::Added,
        Action::Removed,
    ];

    /// Wire key, in the case the server uses.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::List => "List",
            Self::Read => "Read",
            Self::Change => "Change",
            Self::Execute => "Execute",
            Self::Readed => "Readed",
            Self::Changed => "Changed",
            Self::Listed => "Listed",
            Self::Error => "Error",
            Self::Added => "Added",
            Self::Removed => "Removed",
        }
    }

    /// Look up an action by its exact wire key.
    pub fn from_key(key: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|a| a.as_str() == key)
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_key_is_case_sensitive() {
        assert_eq!(Action::from_key("Changed"), Some(Action::Changed));
        assert_eq!(Action::from_key("changed"), None);
    }
}
