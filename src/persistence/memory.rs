//! In-memory store.

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use tokio::sync::RwLock;

use super::{OpportunitySource, PositionStore};
use crate::triangle::{
    ExecutionResults, LegExecution, PositionStatus, TriangleOpportunity, TriangularPosition,
};

/// Process-local position and opportunity store.
///
/// Mutations go through [`TriangularPosition`]'s own transition methods, so
/// the forward-only and leg-ordering rules hold here too.
#[derive(Debug, Default)]
pub struct MemoryStore {
    positions: RwLock<HashMap<String, TriangularPosition>>,
    opportunities: RwLock<HashMap<String, TriangleOpportunity>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert_opportunity(&self, opportunity: TriangleOpportunity) {
        self.opportunities
            .write()
            .await
            .insert(opportunity.id.clone(), opportunity);
    }
}

#[async_trait]
impl PositionStore for MemoryStore {
    async fn create_position(&self, position: &TriangularPosition) -> Result<()> {
        let mut positions = self.positions.write().await;
        if positions.contains_key(&position.id) {
            bail!("position {} already exists", position.id);
        }
        positions.insert(position.id.clone(), position.clone());
        Ok(())
    }

    async fn update_leg(&self, position_id: &str, execution: &LegExecution) -> Result<()> {
        let mut positions = self.positions.write().await;
        let position = positions
            .get_mut(position_id)
            .ok_or_else(|| anyhow!("position {} not found", position_id))?;
        position.record_leg(execution.clone())?;
        Ok(())
    }

    async fn update_status(
        &self,
        position_id: &str,
        status: PositionStatus,
        error_message: Option<String>,
    ) -> Result<()> {
        let mut positions = self.positions.write().await;
        let position = positions
            .get_mut(position_id)
            .ok_or_else(|| anyhow!("position {} not found", position_id))?;
        position.transition(status)?;
        if error_message.is_some() {
            position.error_message = error_message;
        }
        Ok(())
    }

    async fn update_results(&self, position_id: &str, results: &ExecutionResults) -> Result<()> {
        let mut positions = self.positions.write().await;
        let position = positions
            .get_mut(position_id)
            .ok_or_else(|| anyhow!("position {} not found", position_id))?;
        position.complete(results.clone())?;
        Ok(())
    }

    async fn get_position(&self, position_id: &str) -> Result<Option<TriangularPosition>> {
        Ok(self.positions.read().await.get(position_id).cloned())
    }

    async fn list_positions(&self, user_id: Option<&str>) -> Result<Vec<TriangularPosition>> {
        let mut positions: Vec<TriangularPosition> = self
            .positions
            .read()
            .await
            .values()
            .filter(|p| user_id.map_or(true, |u| p.user_id == u))
            .cloned()
            .collect();
        positions.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        Ok(positions)
    }
}

#[async_trait]
impl OpportunitySource for MemoryStore {
    async fn get_opportunity(&self, opportunity_id: &str) -> Result<Option<TriangleOpportunity>> {
        Ok(self.opportunities.read().await.get(opportunity_id).cloned())
    }

    async fn mark_consumed(&self, opportunity_id: &str) -> Result<()> {
        let mut opportunities = self.opportunities.write().await;
        let opportunity = opportunities
            .get_mut(opportunity_id)
            .ok_or_else(|| anyhow!("opportunity {} not found", opportunity_id))?;
        if opportunity.consumed {
            bail!("opportunity {} already consumed", opportunity_id);
        }
        opportunity.consumed = true;
        Ok(())
    }
}
