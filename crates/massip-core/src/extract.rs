use std::sync::Arc;

use crate::entity::{Entity, Location};
use crate::parser::ParserDefinition;

/// Entity type assigned to whole cells when no parser is configured.
pub const WHOLE_CELL_TYPE: &str = "cell";

/// Turns input rows into entities, either by regex or by taking whole cells.
#[derive(Debug, Clone)]
pub enum EntityExtractor {
    Pattern(ParserDefinition),
    WholeCell(Arc<str>),
}

impl EntityExtractor {
    #[must_use]
    pub fn new(parser: Option<ParserDefinition>) -> Self {
        parser.map_or_else(Self::whole_cell, Self::Pattern)
    }

    #[must_use]
    pub fn whole_cell() -> Self {
        Self::WholeCell(Arc::from(WHOLE_CELL_TYPE))
    }

    pub const fn is_whole_cell(&self) -> bool {
        matches!(self, Self::WholeCell(_))
    }

    pub fn entity_type(&self) -> &str {
        match self {
            Self::Pattern(parser) => parser.entity_type(),
            Self::WholeCell(entity_type) => entity_type,
        }
    }

    /// Entities in cell order, then match order within each cell. Never fails;
    /// a row without matches yields nothing.
    pub fn extract(&self, row: &[String], row_index: usize) -> Vec<Entity> {
        match self {
            Self::Pattern(parser) => {
                let entity_type = parser.shared_entity_type();
                row.iter()
                    .enumerate()
                    .flat_map(|(cell, text)| {
                        let entity_type = Arc::clone(&entity_type);
                        parser.find_all(text).into_iter().map(move |value| {
                            Entity::new(
                                value,
                                Arc::clone(&entity_type),
                                Location::new(row_index, cell),
                            )
                        })
                    })
                    .collect()
            }
            Self::WholeCell(entity_type) => row
                .iter()
                .enumerate()
                .filter_map(|(cell, text)| {
                    let value = text.trim();
                    (!value.is_empty()).then(|| {
                        Entity::new(value, Arc::clone(entity_type), Location::new(row_index, cell))
                    })
                })
                .collect(),
        }
    }
}
