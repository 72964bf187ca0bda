/// Result alias that carries the custom [`LedControlError`] type.
pub type Result<T> = std::result::Result<T, LedControlError>;

/// Common error type for the core crate.
///
/// Pattern compile problems and per-frame evaluation failures are not part of
/// this enum: they are reported as data (see [`crate::pattern::CompileReport`])
/// or caught inside the render loop.
#[derive(Debug, thiserror::Error)]
pub enum LedControlError {
    /// Engine construction parameters are unusable.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    /// The pixel mapping does not match the LED count or is malformed.
    #[error("invalid pixel mapping: {0}")]
    InvalidMapping(String),
    #[error("invalid palette {id}: {reason}")]
    InvalidPalette { id: u32, reason: String },
    #[error("unknown pattern {0}")]
    UnknownPattern(u32),
    #[error("unknown palette {0}")]
    UnknownPalette(u32),
    #[error("unknown group `{0}`")]
    UnknownGroup(String),
    #[error("unknown preset `{0}`")]
    UnknownPreset(String),
    /// The reserved default group can never be deleted.
    #[error("group `{0}` cannot be removed")]
    GroupNotRemovable(String),
    /// Built-in patterns and palettes can be edited but not deleted.
    #[error("{kind} {id} is built in and cannot be removed")]
    DefaultNotRemovable { kind: &'static str, id: u32 },
    /// A settings update could not be merged into the live settings tree.
    #[error("invalid settings: {0}")]
    InvalidSettings(#[from] serde_json::Error),
    #[error("persisted state: {0}")]
    Persistence(String),
    #[error(transparent)]
    Output(#[from] crate::output::TransportError),
    #[error("{0}")]
    Io(#[from] std::io::Error),
    /// A shared structure was poisoned by a panicking thread.
    #[error("{0} has been poisoned")]
    Poisoned(&'static str),
    #[error("{0}")]
    Message(String),
}

impl LedControlError {
    /// Creates a new error that simply wraps the provided message.
    pub fn msg<T: Into<String>>(msg: T) -> Self {
        Self::Message(msg.into())
    }
}

impl From<&str> for LedControlError {
    fn from(value: &str) -> Self {
        Self::msg(value)
    }
}

impl From<String> for LedControlError {
    fn from(value: String) -> Self {
        Self::Message(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn messages_name_the_offending_item() {
        let err = LedControlError::GroupNotRemovable("main".to_string());
        assert_eq!(err.to_string(), "group `main` cannot be removed");

        let err = LedControlError::DefaultNotRemovable {
            kind: "palette",
            id: 0,
        };
        assert!(err.to_string().contains("palette 0"));
    }

    #[test]
    fn wraps_serde_errors() {
        let parse = serde_json::from_str::<u32>("nope").unwrap_err();
        let err: LedControlError = parse.into();
        assert!(matches!(err, LedControlError::InvalidSettings(_)));
    }
}
