use std::fmt;
use std::sync::Arc;

use serde::Serialize;

/// Where an entity was found: 1-based record number in the input source and
/// 0-based cell index within that record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct Location {
    pub row: usize,
    pub cell: usize,
}

impl Location {
    #[must_use]
    pub const fn new(row: usize, cell: usize) -> Self {
        Self { row, cell }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entity {
    value: String,
    entity_type: Arc<str>,
    location: Location,
}

impl Entity {
    #[must_use]
    pub fn new(value: impl Into<String>, entity_type: Arc<str>, location: Location) -> Self {
        Self {
            value: value.into(),
            entity_type,
            location,
        }
    }

    pub fn value(&self) -> &str {
        &self.value
    }

    pub fn entity_type(&self) -> &str {
        &self.entity_type
    }

    pub const fn location(&self) -> Location {
        self.location
    }
}

impl fmt::Display for Entity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.value)
    }
}
