use std::fmt;
use thiserror::Error;

/// Identity of the declarative object an error is attributed to.
///
/// Carries the section name and the object's key within that section
/// (a user-chosen name for map sections, `#<index>` for list sections)
/// so fatal messages point at the offending policy statement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectRef {
    pub section: &'static str,
    pub name: String,
}

impl ObjectRef {
    pub fn named(section: &'static str, name: impl Into<String>) -> Self {
        Self {
            section,
            name: name.into(),
        }
    }

    /// Reference for the n-th object of a list section (1-based in messages).
    pub fn indexed(section: &'static str, index: usize) -> Self {
        Self {
            section,
            name: format!("#{}", index + 1),
        }
    }
}

impl fmt::Display for ObjectRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.section, self.name)
    }
}

/// Core error types for rampart
///
/// Every detected problem is a user-configuration error; compilation is
/// all-or-nothing with no retry and no partial rule tree.
#[derive(Debug, Error)]
pub enum Error {
    /// Invalid policy statement, attributed to the originating object
    #[error("{origin}: {message}")]
    Config { origin: ObjectRef, message: String },

    /// Unsatisfiable before/after ordering constraints
    #[error("circular section ordering among: {}", members.join(", "))]
    DependencyCycle { members: Vec<String> },

    /// Ordering constraint naming a section that was never registered
    #[error("section '{section}' orders against unknown section '{reference}'")]
    UnknownSection { section: String, reference: String },

    /// I/O operation failed
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Policy document deserialization failed
    #[error("policy parse error: {0}")]
    Parse(#[from] serde_json::Error),
}

impl Error {
    /// Fatal configuration error attributed to `origin`.
    pub fn config(origin: &ObjectRef, message: impl Into<String>) -> Self {
        Error::Config {
            origin: origin.clone(),
            message: message.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_object_ref_display() {
        assert_eq!(ObjectRef::indexed("filter", 2).to_string(), "filter #3");
        assert_eq!(
            ObjectRef::named("service", "ssh").to_string(),
            "service ssh"
        );
    }

    #[test]
    fn test_config_error_message_carries_attribution() {
        let err = Error::config(&ObjectRef::indexed("filter", 0), "invalid action 'allow'");
        assert_eq!(err.to_string(), "filter #1: invalid action 'allow'");
    }

    #[test]
    fn test_cycle_error_lists_members() {
        let err = Error::DependencyCycle {
            members: vec!["a".into(), "b".into()],
        };
        assert!(err.to_string().contains("a, b"));
    }
}
