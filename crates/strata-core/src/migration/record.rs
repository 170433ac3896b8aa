use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use super::operation::Operation;
use crate::error::{Result, StrataError};

/// Identity of a migration record: namespace plus monotonic name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct MigrationId {
    /// Application namespace (e.g. "yoyaku").
    pub app: String,
    /// Record name (e.g. "0027_myuser_avatar").
    pub name: String,
}

impl MigrationId {
    pub fn new(app: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            app: app.into(),
            name: name.into(),
        }
    }

    /// Leading number of the record name, if it has one.
    pub fn number(&self) -> Option<u32> {
        let digits: String = self.name.chars().take_while(|c| c.is_ascii_digit()).collect();
        digits.parse().ok()
    }
}

impl fmt::Display for MigrationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.app, self.name)
    }
}

impl FromStr for MigrationId {
    type Err = StrataError;

    fn from_str(s: &str) -> Result<Self> {
        match s.split_once('.') {
            Some((app, name)) if !app.is_empty() && !name.is_empty() && !name.contains('.') => {
                Ok(Self::new(app, name))
            }
            _ => Err(StrataError::Validation(format!(
                "invalid migration id '{}', expected 'app.name'",
                s
            ))),
        }
    }
}

impl TryFrom<String> for MigrationId {
    type Error = StrataError;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<MigrationId> for String {
    fn from(id: MigrationId) -> Self {
        id.to_string()
    }
}

/// One named, ordered unit of schema change with declared predecessors.
#[derive(Debug, Clone, PartialEq)]
pub struct MigrationRecord {
    pub id: MigrationId,
    /// Records that must be applied before this one.
    pub dependencies: Vec<MigrationId>,
    /// Operations applied in order.
    pub operations: Vec<Operation>,
    /// Run all operations inside one store transaction.
    pub atomic: bool,
    /// First record of its namespace.
    pub initial: bool,
}

/// On-disk form of a record; identity comes from the file location.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecordFile {
    #[serde(default, skip_serializing_if = "is_false")]
    pub initial: bool,

    #[serde(default = "default_atomic", skip_serializing_if = "is_true")]
    pub atomic: bool,

    #[serde(default)]
    pub dependencies: Vec<MigrationId>,

    #[serde(default)]
    pub operations: Vec<Operation>,
}

fn default_atomic() -> bool {
    true
}

fn is_true(v: &bool) -> bool {
    *v
}

fn is_false(v: &bool) -> bool {
    !*v
}

impl MigrationRecord {
    pub fn new(app: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: MigrationId::new(app, name),
            dependencies: Vec::new(),
            operations: Vec::new(),
            atomic: true,
            initial: false,
        }
    }

    pub fn depends_on(mut self, app: impl Into<String>, name: impl Into<String>) -> Self {
        self.dependencies.push(MigrationId::new(app, name));
        self
    }

    pub fn operation(mut self, operation: Operation) -> Self {
        self.operations.push(operation);
        self
    }

    pub fn initial(mut self) -> Self {
        self.initial = true;
        self
    }

    pub fn non_atomic(mut self) -> Self {
        self.atomic = false;
        self
    }

    pub fn app(&self) -> &str {
        &self.id.app
    }

    /// True when every operation has an inverse.
    pub fn is_reversible(&self) -> bool {
        self.operations.iter().all(Operation::is_reversible)
    }

    /// Parse a record from its TOML file contents.
    pub fn from_toml(id: MigrationId, content: &str) -> Result<Self> {
        let file: RecordFile = toml::from_str(content).map_err(|e| {
            StrataError::Deserialization(format!("Failed to parse migration {}: {}", id, e))
        })?;
        Ok(Self::from_file(id, file))
    }

    pub fn from_file(id: MigrationId, file: RecordFile) -> Self {
        Self {
            id,
            dependencies: file.dependencies,
            operations: file.operations,
            atomic: file.atomic,
            initial: file.initial,
        }
    }

    pub fn to_file(&self) -> RecordFile {
        RecordFile {
            initial: self.initial,
            atomic: self.atomic,
            dependencies: self.dependencies.clone(),
            operations: self.operations.clone(),
        }
    }

    /// Render the record body as TOML.
    pub fn to_toml(&self) -> Result<String> {
        Ok(toml::to_string_pretty(&self.to_file())?)
    }
}
