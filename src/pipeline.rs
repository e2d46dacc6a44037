/*!
 * @file pipeline.rs
 * @brief Parsed aggregation pipeline
 */

use crate::stage::Stage;

/// An ordered stage sequence bound to the unqualified name of the target
/// collection. Immutable after construction.
#[derive(Debug, Clone, PartialEq)]
pub struct Pipeline {
    collection: String,
    stages: Vec<Stage>,
}

impl Pipeline {
    pub fn new(collection: impl Into<String>, stages: Vec<Stage>) -> Self {
        Self {
            collection: collection.into(),
            stages,
        }
    }

    pub fn collection(&self) -> &str {
        &self.collection
    }

    pub fn stages(&self) -> &[Stage] {
        &self.stages
    }
}
