//! Validated command names.

use core::fmt;

use crate::error::CommandError;

/// Longest accepted command name, in bytes.
pub const MAX_COMMAND_LEN: usize = 64;

/// A command name: non-empty, printable ASCII, bounded length.
///
/// Commands identify handlers and appear verbatim on the wire and in logs;
/// the rules keep them stable as map keys and safe to print. Control frames
/// (Ping, Close) carry no command and use the crate-internal empty value.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Command(String);

impl Command {
    pub fn new(name: &str) -> Result<Self, CommandError> {
        if name.is_empty() {
            return Err(CommandError::Empty);
        }
        if name.len() > MAX_COMMAND_LEN {
            return Err(CommandError::TooLong {
                len: name.len(),
                max: MAX_COMMAND_LEN,
            });
        }
        match name.bytes().find(|b| !b.is_ascii_graphic()) {
            Some(byte) => Err(CommandError::Unprintable { byte }),
            None => Ok(Self(name.to_owned())),
        }
    }

    /// The empty command carried by control frames.
    pub(crate) fn none() -> Self {
        Self(String::new())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for Command {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_printable_names() {
        for name in ["ping", "TransactionCommit", "host.search", "a"] {
            assert_eq!(Command::new(name).unwrap().as_str(), name);
        }
    }

    #[test]
    fn rejects_empty() {
        assert_eq!(Command::new(""), Err(CommandError::Empty));
    }

    #[test]
    fn rejects_overlong() {
        let name = "x".repeat(MAX_COMMAND_LEN + 1);
        assert!(matches!(
            Command::new(&name),
            Err(CommandError::TooLong { .. })
        ));
    }

    #[test]
    fn rejects_spaces_and_control_bytes() {
        assert!(matches!(
            Command::new("two words"),
            Err(CommandError::Unprintable { byte: b' ' })
        ));
        assert!(matches!(
            Command::new("tab\there"),
            Err(CommandError::Unprintable { byte: b'\t' })
        ));
    }
}
