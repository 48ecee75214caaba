//! Named commands attached to a cache and run via `invoke`.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use crate::value::Value;

/// A command registered on a cache at start time.
///
/// Read commands transform the value under a key into a reply without
/// writing. Write commands return `(reply, new_value)`; when the new value
/// equals the existing one the write is skipped entirely.
#[derive(Clone)]
pub enum Command {
    /// A read-only transform of the stored value
    Read(Arc<dyn Fn(&Value) -> Value + Send + Sync>),
    /// A transform returning `(reply, new_value)`
    Write(Arc<dyn Fn(&Value) -> (Value, Value) + Send + Sync>),
}

impl Command {
    /// Build a read command from a plain function.
    pub fn read<F>(transform: F) -> Self
    where
        F: Fn(&Value) -> Value + Send + Sync + 'static,
    {
        Command::Read(Arc::new(transform))
    }

    /// Build a write command from a plain function.
    pub fn write<F>(transform: F) -> Self
    where
        F: Fn(&Value) -> (Value, Value) + Send + Sync + 'static,
    {
        Command::Write(Arc::new(transform))
    }
}

impl fmt::Debug for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Command::Read(_) => f.write_str("Command::Read"),
            Command::Write(_) => f.write_str("Command::Write"),
        }
    }
}

/// The per-cache command lookup table.
#[derive(Clone, Debug, Default)]
pub(crate) struct CommandTable {
    map: HashMap<String, Command>,
}

impl CommandTable {
    pub(crate) fn new(map: HashMap<String, Command>) -> Self {
        CommandTable { map }
    }

    pub(crate) fn find(&self, name: &str) -> Option<&Command> {
        self.map.get(name)
    }
}
