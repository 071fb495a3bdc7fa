//! Persistence for triangular positions and opportunities.
//!
//! The orchestrator talks to storage through two narrow traits:
//! - [`PositionStore`]: create, per-leg update, status update, final results, read, list
//! - [`OpportunitySource`]: read by id, mark consumed
//!
//! [`MemoryStore`] backs tests and the paper CLI; [`SqliteStore`] persists
//! across restarts. Both refuse to modify a position once it is terminal,
//! except for recording the fill of a leg that was in flight when it was
//! cancelled.

mod memory;
mod sqlite;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

use anyhow::Result;
use async_trait::async_trait;

use crate::triangle::{
    ExecutionResults, LegExecution, PositionStatus, TriangleOpportunity, TriangularPosition,
};

/// Storage for triangular positions.
#[async_trait]
pub trait PositionStore: Send + Sync {
    async fn create_position(&self, position: &TriangularPosition) -> Result<()>;

    /// Record a leg's execution and advance the status to the next leg.
    /// On a `CANCELLED` position the record is stored and the status kept.
    async fn update_leg(&self, position_id: &str, execution: &LegExecution) -> Result<()>;

    async fn update_status(
        &self,
        position_id: &str,
        status: PositionStatus,
        error_message: Option<String>,
    ) -> Result<()>;

    /// Store final results and mark the position `COMPLETED`.
    async fn update_results(&self, position_id: &str, results: &ExecutionResults) -> Result<()>;

    async fn get_position(&self, position_id: &str) -> Result<Option<TriangularPosition>>;

    /// Positions, newest first, optionally filtered by user.
    async fn list_positions(&self, user_id: Option<&str>) -> Result<Vec<TriangularPosition>>;
}

/// Source of detected opportunities.
#[async_trait]
pub trait OpportunitySource: Send + Sync {
    async fn get_opportunity(&self, opportunity_id: &str) -> Result<Option<TriangleOpportunity>>;

    /// Claim an opportunity; fails if it was already consumed.
    async fn mark_consumed(&self, opportunity_id: &str) -> Result<()>;
}
