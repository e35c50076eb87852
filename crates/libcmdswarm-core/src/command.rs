//! Command lines sent to the target server

use serde::{Deserialize, Serialize};

use crate::error::{Result, SwarmError};

/// What a response must contain for the command to count as a success
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Expectation {
    #[default]
    Anything,
    /// Response contains the text verbatim
    Contains(String),
    /// Response contains the text, ignoring ASCII case
    ContainsIgnoreCase(String),
}

impl Expectation {
    /// Check a response, returning a description of the mismatch on failure
    pub fn check(&self, response: &str) -> std::result::Result<(), String> {
        match self {
            Expectation::Anything => Ok(()),
            Expectation::Contains(needle) => {
                if response.contains(needle.as_str()) {
                    Ok(())
                } else {
                    Err(format!(
                        "expected '{}' in response, got: {}",
                        preview(needle),
                        preview(response)
                    ))
                }
            }
            Expectation::ContainsIgnoreCase(needle) => {
                if response
                    .to_ascii_lowercase()
                    .contains(&needle.to_ascii_lowercase())
                {
                    Ok(())
                } else {
                    Err(format!(
                        "expected '{}' in response, got: {}",
                        preview(needle),
                        preview(response)
                    ))
                }
            }
        }
    }
}

/// An immutable command line plus the metric label it is recorded under
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Command {
    text: String,
    name: String,
    expect: Expectation,
}

impl Command {
    /// Create a command named after its first token
    pub fn new(text: impl Into<String>) -> Result<Self> {
        let text = text.into();
        validate_text(&text)?;
        let name = default_name(&text);
        Ok(Self {
            text,
            name,
            expect: Expectation::Anything,
        })
    }

    /// Create a command recorded under an explicit operation name
    pub fn named(text: impl Into<String>, name: impl Into<String>) -> Result<Self> {
        let text = text.into();
        validate_text(&text)?;
        let name = name.into();
        if name.trim().is_empty() {
            return Err(SwarmError::InvalidCommand(format!(
                "empty operation name for '{}'",
                text
            )));
        }
        Ok(Self {
            text,
            name,
            expect: Expectation::Anything,
        })
    }

    /// Built-in commands whose text is known to be a single line
    pub(crate) fn builtin(text: impl Into<String>, name: &str) -> Self {
        let text = text.into();
        debug_assert!(validate_text(&text).is_ok());
        Self {
            text,
            name: name.to_string(),
            expect: Expectation::Anything,
        }
    }

    /// Attach a response expectation
    pub fn expecting(mut self, expect: Expectation) -> Self {
        self.expect = expect;
        self
    }

    /// Same command text recorded under another name
    pub fn renamed(&self, name: impl Into<String>) -> Self {
        Self {
            text: self.text.clone(),
            name: name.into(),
            expect: self.expect.clone(),
        }
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn expectation(&self) -> &Expectation {
        &self.expect
    }

    /// The wire form: text plus a single newline terminator
    pub fn to_line(&self) -> String {
        let mut line = String::with_capacity(self.text.len() + 1);
        line.push_str(&self.text);
        line.push('\n');
        line
    }
}

fn validate_text(text: &str) -> Result<()> {
    if text.trim().is_empty() {
        return Err(SwarmError::InvalidCommand("empty command text".to_string()));
    }
    if text.contains('\n') || text.contains('\r') {
        return Err(SwarmError::InvalidCommand(format!(
            "command contains a line break: {:?}",
            text
        )));
    }
    Ok(())
}

fn default_name(text: &str) -> String {
    text.split_whitespace().next().unwrap_or(text).to_string()
}

/// Shorten long payloads for log and error messages
fn preview(text: &str) -> String {
    const MAX: usize = 80;
    let trimmed = text.trim_end();
    if trimmed.chars().count() > MAX {
        let head: String = trimmed.chars().take(MAX).collect();
        format!("{}... ({} bytes)", head, trimmed.len())
    } else {
        trimmed.to_string()
    }
}
