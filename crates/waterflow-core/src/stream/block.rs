use super::{ContextFilter, Stage};
use crate::{FlowContext, FlowError};
use std::collections::HashMap;
use std::sync::Weak;

/// Resume handle of a manual stage, keyed by position.
#[derive(Clone)]
pub struct Block {
    position: String,
    stage: Weak<Stage>,
    filter: Option<ContextFilter>,
}

impl Block {
    pub fn new(position: impl Into<String>, stage: Weak<Stage>, filter: Option<ContextFilter>) -> Self {
        Self {
            position: position.into(),
            stage,
            filter,
        }
    }

    pub fn position(&self) -> &str {
        &self.position
    }

    /// Apply the resume filter and run the parked stage over `contexts`.
    pub async fn process(&self, contexts: Vec<FlowContext>) -> Result<usize, FlowError> {
        let stage = self
            .stage
            .upgrade()
            .ok_or_else(|| FlowError::System(format!("stage at {} was dropped", self.position)))?;
        let contexts = match &self.filter {
            Some(filter) => filter(contexts).await?,
            None => contexts,
        };
        stage.process(contexts).await
    }
}

impl std::fmt::Debug for Block {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Block")
            .field("position", &self.position)
            .field("filtered", &self.filter.is_some())
            .finish()
    }
}

/// Suspended manual stages of one flow.
#[derive(Debug, Default, Clone)]
pub struct BlockTable {
    blocks: HashMap<String, Block>,
}

impl BlockTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, block: Block) {
        self.blocks.insert(block.position.clone(), block);
    }

    pub fn get(&self, position: &str) -> Result<&Block, FlowError> {
        self.blocks
            .get(position)
            .ok_or_else(|| FlowError::NotBlocked(position.to_string()))
    }

    pub fn contains(&self, position: &str) -> bool {
        self.blocks.contains_key(position)
    }

    pub fn positions(&self) -> impl Iterator<Item = &str> {
        self.blocks.keys().map(String::as_str)
    }

    /// Resume the stage parked at `position`.
    pub async fn resume(&self, position: &str, contexts: Vec<FlowContext>) -> Result<usize, FlowError> {
        self.get(position)?.process(contexts).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_unknown_position_is_not_blocked() {
        let table = BlockTable::new();
        let err = table.resume("nowhere", Vec::new()).await.unwrap_err();
        assert!(matches!(err, FlowError::NotBlocked(p) if p == "nowhere"));
    }

    #[tokio::test]
    async fn test_dropped_stage_surfaces_as_system_error() {
        let mut table = BlockTable::new();
        table.insert(Block::new("review", Weak::new(), None));
        assert!(table.contains("review"));
        let err = table.resume("review", Vec::new()).await.unwrap_err();
        assert!(matches!(err, FlowError::System(_)));
    }
}
