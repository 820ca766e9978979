//! Outgoing commands.
//!
//! ```text
//! <command name=".." sequence-id=".." scope="..">
//!     <param name=".." value=".."/>
//!     ...
//! </command>
//! ```
//!
//! A [`Command`] is created by the
//! [`CommandProcessor`](crate::processor::CommandProcessor), which stamps it
//! with a fresh correlation id. Sending consumes it, so each command goes
//! out exactly once.

use std::fmt;

use crate::message::{ATTR_SEQUENCE_ID, Message};

// ── Tags and attributes ──────────────────────────────────────────

pub const COMMAND_TAG: &str = "command";
pub const COMMAND_NAME: &str = "name";
pub const COMMAND_SCOPE: &str = "scope";

pub const PARAM_TAG: &str = "param";
pub const PARAM_NAME: &str = "name";
pub const PARAM_VALUE: &str = "value";

/// Structured addressing element (`<scope>...</scope>`).
pub const SCOPE_TAG: &str = "scope";

// ── Command ──────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    root: Message,
}

impl Command {
    pub(crate) fn new(id: String, name: &str, scope: Option<&str>) -> Self {
        let mut root = Message::new(COMMAND_TAG);
        root.set_attr(ATTR_SEQUENCE_ID, id);
        root.set_attr(COMMAND_NAME, name);
        if let Some(scope) = scope {
            root.set_attr(COMMAND_SCOPE, scope);
        }
        Self { root }
    }

    /// The correlation id the response will carry.
    pub fn id(&self) -> &str {
        self.root.attr(ATTR_SEQUENCE_ID).unwrap_or_default()
    }

    pub fn name(&self) -> &str {
        self.root.attr(COMMAND_NAME).unwrap_or_default()
    }

    pub fn scope(&self) -> Option<&str> {
        self.root.attr(COMMAND_SCOPE)
    }

    /// Address the command to `scope` and return a `<scope>` element for
    /// structured addressing entries.
    pub fn scope_element(&mut self, scope: &str) -> &mut Message {
        self.root.set_attr(COMMAND_SCOPE, scope);
        self.root.push_child(Message::new(SCOPE_TAG))
    }

    /// Attach a `<param name=.. value=..>` to the command itself.
    pub fn param(&mut self, name: &str, value: impl Into<String>) -> &mut Self {
        add_param(&mut self.root, name, value);
        self
    }

    /// Attach an arbitrary sub-element and return it for population.
    pub fn tag(&mut self, tag: &str) -> &mut Message {
        self.root.push_child(Message::new(tag))
    }

    /// Set an attribute on the command element.
    pub fn set_attr(&mut self, name: &str, value: impl Into<String>) -> &mut Self {
        self.root.set_attr(name, value);
        self
    }

    pub fn message(&self) -> &Message {
        &self.root
    }

    pub fn into_message(self) -> Message {
        self.root
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.root, f)
    }
}

/// Attach a `<param name=.. value=..>` element to `parent`.
pub fn add_param<'a>(parent: &'a mut Message, name: &str, value: impl Into<String>) -> &'a mut Message {
    let param = parent.push_child(Message::new(PARAM_TAG));
    param.set_attr(PARAM_NAME, name);
    param.set_attr(PARAM_VALUE, value);
    param
}
