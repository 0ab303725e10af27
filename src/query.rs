//! Query definitions
//!
//! [`QueryDefinition`] is the immutable description of one command: text,
//! kind, parameters, timeout, isolation hint, target connection, and an
//! opaque tag. Parameters are plain clonable records so the executor can
//! re-bind them on retry.

use std::collections::HashSet;
use std::time::Duration;

use crate::driver::IsolationLevel;
use crate::error::{Error, Result};
use crate::value::Value;

/// How the command text is interpreted by the driver
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum CommandKind {
    /// Plain SQL text
    #[default]
    Text,
    /// Stored-procedure identifier
    StoredProcedure,
}

/// Parameter direction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ParameterDirection {
    /// Input-only (default)
    #[default]
    Input,
    /// Output-only
    Output,
    /// Bidirectional
    InputOutput,
    /// Stored-procedure return value
    ReturnValue,
}

/// Explicit database type hint for a parameter
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[allow(missing_docs)]
pub enum DbType {
    Bool,
    Int16,
    Int32,
    Int64,
    Float32,
    Float64,
    Decimal,
    String,
    Bytes,
    Date,
    Time,
    DateTime,
    DateTimeTz,
    Uuid,
    Json,
}

/// Per-query command timeout
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CommandTimeout {
    /// Use the global default from the options snapshot
    #[default]
    UseDefault,
    /// No timeout at all (the driver's "no timeout" sentinel)
    Infinite,
    /// Explicit cap; a zero duration falls back to the global default
    After(Duration),
}

impl CommandTimeout {
    /// Resolve against the global default. `None` means "no timeout".
    pub fn resolve(self, default: Duration) -> Option<Duration> {
        match self {
            Self::UseDefault => Some(default),
            Self::Infinite => None,
            Self::After(d) if d.is_zero() => Some(default),
            Self::After(d) => Some(d),
        }
    }
}

/// A single command parameter
#[derive(Debug, Clone, PartialEq)]
pub struct QueryParameter {
    /// Parameter name; a driver-specific sigil prefix is permitted
    pub name: String,
    /// Payload; `Value::Null` binds a database NULL
    pub value: Value,
    /// Optional explicit type hint
    pub db_type: Option<DbType>,
    /// Direction; `Input` unless stated otherwise
    pub direction: ParameterDirection,
    /// Size hint for string/binary types
    pub size: Option<u32>,
    /// Precision hint for numeric types
    pub precision: Option<u32>,
    /// Scale hint for numeric types
    pub scale: Option<u32>,
}

impl QueryParameter {
    /// Create an input parameter
    pub fn new(name: impl Into<String>, value: impl Into<Value>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
            db_type: None,
            direction: ParameterDirection::Input,
            size: None,
            precision: None,
            scale: None,
        }
    }

    /// Create a parameter bound to database NULL
    pub fn null(name: impl Into<String>) -> Self {
        Self::new(name, Value::Null)
    }

    /// Set the explicit type hint
    pub fn with_db_type(mut self, db_type: DbType) -> Self {
        self.db_type = Some(db_type);
        self
    }

    /// Set the direction
    pub fn with_direction(mut self, direction: ParameterDirection) -> Self {
        self.direction = direction;
        self
    }

    /// Set the size hint
    pub fn with_size(mut self, size: u32) -> Self {
        self.size = Some(size);
        self
    }

    /// Set precision and scale hints
    pub fn with_precision_scale(mut self, precision: u32, scale: u32) -> Self {
        self.precision = Some(precision);
        self.scale = Some(scale);
        self
    }
}

/// Immutable description of one database command
#[derive(Debug, Clone, PartialEq)]
pub struct QueryDefinition {
    /// SQL text or stored-procedure identifier; never empty
    pub command_text: String,
    /// Text vs stored procedure
    pub command_kind: CommandKind,
    /// Ordered parameters; names are unique within the definition
    pub parameters: Vec<QueryParameter>,
    /// Per-query timeout override
    pub command_timeout: CommandTimeout,
    /// Isolation hint; `None` defers to the options default,
    /// `Unspecified` runs without a transaction
    pub isolation: Option<IsolationLevel>,
    /// Logical connection name; `None` or blank targets the default
    pub connection_name: Option<String>,
    /// Opaque tag propagated into the execution context for middleware
    pub tag: Option<String>,
}

impl QueryDefinition {
    /// Create a plain-text command
    pub fn text(command_text: impl Into<String>) -> Self {
        Self {
            command_text: command_text.into(),
            command_kind: CommandKind::Text,
            parameters: Vec::new(),
            command_timeout: CommandTimeout::UseDefault,
            isolation: None,
            connection_name: None,
            tag: None,
        }
    }

    /// Create a stored-procedure command
    pub fn stored_procedure(name: impl Into<String>) -> Self {
        Self {
            command_kind: CommandKind::StoredProcedure,
            ..Self::text(name)
        }
    }

    /// Append a parameter
    pub fn with_parameter(mut self, parameter: QueryParameter) -> Self {
        self.parameters.push(parameter);
        self
    }

    /// Replace the parameter list
    pub fn with_parameters(mut self, parameters: Vec<QueryParameter>) -> Self {
        self.parameters = parameters;
        self
    }

    /// Set the per-query timeout
    pub fn with_timeout(mut self, timeout: CommandTimeout) -> Self {
        self.command_timeout = timeout;
        self
    }

    /// Set the isolation hint
    pub fn with_isolation(mut self, isolation: IsolationLevel) -> Self {
        self.isolation = Some(isolation);
        self
    }

    /// Target a logical connection name
    pub fn with_connection_name(mut self, name: impl Into<String>) -> Self {
        self.connection_name = Some(name.into());
        self
    }

    /// Attach an opaque tag
    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tag = Some(tag.into());
        self
    }

    /// Structural validation: non-empty text, unique parameter names.
    pub fn validate(&self) -> Result<()> {
        if self.command_text.trim().is_empty() {
            return Err(Error::config("command text must not be empty"));
        }
        let mut seen = HashSet::with_capacity(self.parameters.len());
        for param in &self.parameters {
            if param.name.trim().is_empty() {
                return Err(Error::config("parameter name must not be empty"));
            }
            if !seen.insert(param.name.to_ascii_lowercase()) {
                return Err(Error::config(format!(
                    "duplicate parameter name: {}",
                    param.name
                )));
            }
        }
        Ok(())
    }
}
