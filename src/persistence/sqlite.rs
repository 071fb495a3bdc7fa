//! SQLite-backed store.
//!
//! Decimals are stored as TEXT and timestamps as RFC 3339 strings. Final
//! results are kept as a JSON column since they are only ever read whole.

use anyhow::{anyhow, bail, ensure, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use rust_decimal::Decimal;
use std::path::Path;
use std::str::FromStr;
use std::sync::{Mutex, MutexGuard};
use tracing::{debug, info};

use super::{OpportunitySource, PositionStore};
use crate::exchange::OrderSide;
use crate::triangle::{
    ExecutionResults, LegExecution, PositionStatus, TriangleDirection, TriangleOpportunity,
    TriangularPosition,
};

/// SQLite position and opportunity store.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

fn dec(value: String) -> Decimal {
    Decimal::from_str(&value).unwrap_or_default()
}

fn timestamp(value: String) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(&value)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

impl SqliteStore {
    /// Open (or create) the database and initialize the schema.
    pub fn new<P: AsRef<Path>>(db_path: P) -> Result<Self> {
        let conn = Connection::open(db_path.as_ref())
            .with_context(|| format!("Failed to open database at {:?}", db_path.as_ref()))?;

        let store = Self {
            conn: Mutex::new(conn),
        };
        store.init_schema()?;

        info!("Position store initialized at {:?}", db_path.as_ref());
        Ok(store)
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| anyhow!("database connection mutex poisoned"))
    }

    fn init_schema(&self) -> Result<()> {
        self.lock()?.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS opportunities (
                id TEXT PRIMARY KEY,
                exchange TEXT NOT NULL,
                symbol1 TEXT NOT NULL,
                symbol2 TEXT NOT NULL,
                symbol3 TEXT NOT NULL,
                base_asset TEXT NOT NULL,
                quote_asset TEXT NOT NULL,
                bridge_asset TEXT NOT NULL,
                expected_profit_pct TEXT NOT NULL,
                consumed INTEGER NOT NULL DEFAULT 0,
                discovered_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS triangular_positions (
                id TEXT PRIMARY KEY,
                user_id TEXT NOT NULL,
                exchange TEXT NOT NULL,
                credential_ref TEXT,
                opportunity_id TEXT NOT NULL,
                symbol1 TEXT NOT NULL,
                symbol2 TEXT NOT NULL,
                symbol3 TEXT NOT NULL,
                base_asset TEXT NOT NULL,
                quote_asset TEXT NOT NULL,
                bridge_asset TEXT NOT NULL,
                direction TEXT NOT NULL,
                entry_qty TEXT NOT NULL,
                expected_return_qty TEXT NOT NULL,
                expected_profit_pct TEXT NOT NULL,
                expected_profit_amount TEXT NOT NULL,
                max_slippage_pct TEXT NOT NULL,
                execution_timeout_secs INTEGER NOT NULL,
                status TEXT NOT NULL,
                error_message TEXT,
                started_at TEXT NOT NULL,
                completed_at TEXT,
                results_json TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_positions_user ON triangular_positions(user_id);

            CREATE TABLE IF NOT EXISTS triangular_legs (
                position_id TEXT NOT NULL REFERENCES triangular_positions(id),
                leg INTEGER NOT NULL,
                symbol TEXT NOT NULL,
                side TEXT NOT NULL,
                planned_qty TEXT NOT NULL,
                planned_price TEXT NOT NULL,
                order_id TEXT NOT NULL,
                filled_qty TEXT NOT NULL,
                output_amount TEXT NOT NULL,
                avg_price TEXT NOT NULL,
                fees TEXT NOT NULL,
                executed_at TEXT NOT NULL,
                PRIMARY KEY (position_id, leg)
            );
            "#,
        )?;

        Ok(())
    }

    /// Insert or replace an opportunity.
    pub fn insert_opportunity(&self, opportunity: &TriangleOpportunity) -> Result<()> {
        let o = opportunity;
        self.lock()?.execute(
            r#"
            INSERT OR REPLACE INTO opportunities
                (id, exchange, symbol1, symbol2, symbol3, base_asset, quote_asset, bridge_asset,
                 expected_profit_pct, consumed, discovered_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
            "#,
            params![
                o.id,
                o.exchange,
                o.symbols[0],
                o.symbols[1],
                o.symbols[2],
                o.base_asset,
                o.quote_asset,
                o.bridge_asset,
                o.expected_profit_pct.to_string(),
                o.consumed,
                o.discovered_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    fn current_status(conn: &Connection, position_id: &str) -> Result<PositionStatus> {
        let status: Option<String> = conn
            .query_row(
                "SELECT status FROM triangular_positions WHERE id = ?1",
                params![position_id],
                |row| row.get(0),
            )
            .optional()?;

        let status = status.ok_or_else(|| anyhow!("position {} not found", position_id))?;
        PositionStatus::parse(&status)
            .ok_or_else(|| anyhow!("position {} has unknown status {}", position_id, status))
    }

    fn ensure_transition(
        conn: &Connection,
        position_id: &str,
        next: PositionStatus,
    ) -> Result<PositionStatus> {
        let current = Self::current_status(conn, position_id)?;
        ensure!(
            current.can_transition_to(next),
            "position {} cannot move from {} to {}",
            position_id,
            current,
            next
        );
        Ok(current)
    }

    fn read_leg(row: &Row<'_>) -> rusqlite::Result<LegExecution> {
        let side: String = row.get(2)?;
        Ok(LegExecution {
            leg: row.get(0)?,
            symbol: row.get(1)?,
            side: OrderSide::parse(&side).unwrap_or(OrderSide::Buy),
            planned_qty: dec(row.get(3)?),
            planned_price: dec(row.get(4)?),
            order_id: row.get(5)?,
            filled_qty: dec(row.get(6)?),
            output_amount: dec(row.get(7)?),
            avg_price: dec(row.get(8)?),
            fees: dec(row.get(9)?),
            executed_at: timestamp(row.get(10)?),
        })
    }

    fn read_position(row: &Row<'_>) -> rusqlite::Result<TriangularPosition> {
        let direction: String = row.get(11)?;
        let status: String = row.get(18)?;
        let completed_at: Option<String> = row.get(21)?;
        let results_json: Option<String> = row.get(22)?;

        Ok(TriangularPosition {
            id: row.get(0)?,
            user_id: row.get(1)?,
            exchange: row.get(2)?,
            credential_ref: row.get(3)?,
            opportunity_id: row.get(4)?,
            symbols: [row.get(5)?, row.get(6)?, row.get(7)?],
            base_asset: row.get(8)?,
            quote_asset: row.get(9)?,
            bridge_asset: row.get(10)?,
            direction: if direction == "reverse" {
                TriangleDirection::Reverse
            } else {
                TriangleDirection::Forward
            },
            entry_qty: dec(row.get(12)?),
            expected_return_qty: dec(row.get(13)?),
            expected_profit_pct: dec(row.get(14)?),
            expected_profit_amount: dec(row.get(15)?),
            max_slippage_pct: dec(row.get(16)?),
            execution_timeout_secs: row.get(17)?,
            legs: [None, None, None],
            status: PositionStatus::parse(&status).unwrap_or(PositionStatus::Error),
            error_message: row.get(19)?,
            started_at: timestamp(row.get(20)?),
            completed_at: completed_at.map(timestamp),
            results: results_json.and_then(|json| serde_json::from_str(&json).ok()),
        })
    }

    fn load_legs(conn: &Connection, position: &mut TriangularPosition) -> Result<()> {
        let mut stmt = conn.prepare(
            r#"
            SELECT leg, symbol, side, planned_qty, planned_price, order_id, filled_qty,
                   output_amount, avg_price, fees, executed_at
            FROM triangular_legs WHERE position_id = ?1 ORDER BY leg
            "#,
        )?;

        let legs = stmt
            .query_map(params![position.id], Self::read_leg)?
            .filter_map(|r| r.ok());

        for leg in legs {
            if (1..=3).contains(&leg.leg) {
                let idx = usize::from(leg.leg - 1);
                position.legs[idx] = Some(leg);
            }
        }
        Ok(())
    }
}

const POSITION_COLUMNS: &str = r#"
    id, user_id, exchange, credential_ref, opportunity_id, symbol1, symbol2, symbol3,
    base_asset, quote_asset, bridge_asset, direction, entry_qty, expected_return_qty,
    expected_profit_pct, expected_profit_amount, max_slippage_pct, execution_timeout_secs,
    status, error_message, started_at, completed_at, results_json
"#;

#[async_trait]
impl PositionStore for SqliteStore {
    async fn create_position(&self, position: &TriangularPosition) -> Result<()> {
        let p = position;
        let results_json = p.results.as_ref().map(serde_json::to_string).transpose()?;

        self.lock()?
            .execute(
                &format!(
                    "INSERT INTO triangular_positions ({}) VALUES \
                     (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, \
                      ?17, ?18, ?19, ?20, ?21, ?22, ?23)",
                    POSITION_COLUMNS
                ),
                params![
                    p.id,
                    p.user_id,
                    p.exchange,
                    p.credential_ref,
                    p.opportunity_id,
                    p.symbols[0],
                    p.symbols[1],
                    p.symbols[2],
                    p.base_asset,
                    p.quote_asset,
                    p.bridge_asset,
                    p.direction.to_string(),
                    p.entry_qty.to_string(),
                    p.expected_return_qty.to_string(),
                    p.expected_profit_pct.to_string(),
                    p.expected_profit_amount.to_string(),
                    p.max_slippage_pct.to_string(),
                    p.execution_timeout_secs,
                    p.status.as_str(),
                    p.error_message,
                    p.started_at.to_rfc3339(),
                    p.completed_at.map(|t| t.to_rfc3339()),
                    results_json,
                ],
            )
            .with_context(|| format!("Failed to insert position {}", p.id))?;

        debug!(position_id = %p.id, status = %p.status, "Position created");
        Ok(())
    }

    async fn update_leg(&self, position_id: &str, execution: &LegExecution) -> Result<()> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;

        // A cancel may land while the leg's order is in flight; its fill is
        // still recorded, without advancing the status.
        let current = Self::current_status(&tx, position_id)?;
        let cancelled = current == PositionStatus::Cancelled;
        ensure!(
            current.executing_leg() == Some(execution.leg)
                || (cancelled && (1..=3).contains(&execution.leg)),
            "position {} is {}; cannot record leg {}",
            position_id,
            current,
            execution.leg
        );
        if execution.leg > 1 {
            let previous: Option<u8> = tx
                .query_row(
                    "SELECT leg FROM triangular_legs WHERE position_id = ?1 AND leg = ?2",
                    params![position_id, execution.leg - 1],
                    |row| row.get(0),
                )
                .optional()?;
            ensure!(
                previous.is_some(),
                "position {} has no leg {} recorded; cannot record leg {}",
                position_id,
                execution.leg - 1,
                execution.leg
            );
        }

        let e = execution;
        tx.execute(
            r#"
            INSERT INTO triangular_legs
                (position_id, leg, symbol, side, planned_qty, planned_price, order_id,
                 filled_qty, output_amount, avg_price, fees, executed_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
            "#,
            params![
                position_id,
                e.leg,
                e.symbol,
                e.side.as_str(),
                e.planned_qty.to_string(),
                e.planned_price.to_string(),
                e.order_id,
                e.filled_qty.to_string(),
                e.output_amount.to_string(),
                e.avg_price.to_string(),
                e.fees.to_string(),
                e.executed_at.to_rfc3339(),
            ],
        )?;

        if !cancelled {
            let next = PositionStatus::executing(e.leg + 1).unwrap_or(current);
            tx.execute(
                "UPDATE triangular_positions SET status = ?1 WHERE id = ?2",
                params![next.as_str(), position_id],
            )?;
        }

        tx.commit()?;
        Ok(())
    }

    async fn update_status(
        &self,
        position_id: &str,
        status: PositionStatus,
        error_message: Option<String>,
    ) -> Result<()> {
        let conn = self.lock()?;
        Self::ensure_transition(&conn, position_id, status)?;

        let completed_at = status.is_terminal().then(|| Utc::now().to_rfc3339());
        conn.execute(
            r#"
            UPDATE triangular_positions
            SET status = ?1,
                error_message = COALESCE(?2, error_message),
                completed_at = COALESCE(?3, completed_at)
            WHERE id = ?4
            "#,
            params![status.as_str(), error_message, completed_at, position_id],
        )?;
        Ok(())
    }

    async fn update_results(&self, position_id: &str, results: &ExecutionResults) -> Result<()> {
        let conn = self.lock()?;
        Self::ensure_transition(&conn, position_id, PositionStatus::Completed)?;

        conn.execute(
            r#"
            UPDATE triangular_positions
            SET status = ?1, results_json = ?2, completed_at = ?3
            WHERE id = ?4
            "#,
            params![
                PositionStatus::Completed.as_str(),
                serde_json::to_string(results)?,
                Utc::now().to_rfc3339(),
                position_id,
            ],
        )?;
        Ok(())
    }

    async fn get_position(&self, position_id: &str) -> Result<Option<TriangularPosition>> {
        let conn = self.lock()?;
        let position = conn
            .query_row(
                &format!(
                    "SELECT {} FROM triangular_positions WHERE id = ?1",
                    POSITION_COLUMNS
                ),
                params![position_id],
                Self::read_position,
            )
            .optional()?;

        match position {
            Some(mut position) => {
                Self::load_legs(&conn, &mut position)?;
                Ok(Some(position))
            }
            None => Ok(None),
        }
    }

    async fn list_positions(&self, user_id: Option<&str>) -> Result<Vec<TriangularPosition>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM triangular_positions \
             WHERE (?1 IS NULL OR user_id = ?1) ORDER BY started_at DESC",
            POSITION_COLUMNS
        ))?;

        let mut positions: Vec<TriangularPosition> = stmt
            .query_map(params![user_id], Self::read_position)?
            .filter_map(|r| r.ok())
            .collect();

        for position in &mut positions {
            Self::load_legs(&conn, position)?;
        }
        Ok(positions)
    }
}

#[async_trait]
impl OpportunitySource for SqliteStore {
    async fn get_opportunity(&self, opportunity_id: &str) -> Result<Option<TriangleOpportunity>> {
        let conn = self.lock()?;
        let opportunity = conn
            .query_row(
                r#"
                SELECT id, exchange, symbol1, symbol2, symbol3, base_asset, quote_asset,
                       bridge_asset, expected_profit_pct, consumed, discovered_at
                FROM opportunities WHERE id = ?1
                "#,
                params![opportunity_id],
                |row| {
                    Ok(TriangleOpportunity {
                        id: row.get(0)?,
                        exchange: row.get(1)?,
                        symbols: [row.get(2)?, row.get(3)?, row.get(4)?],
                        base_asset: row.get(5)?,
                        quote_asset: row.get(6)?,
                        bridge_asset: row.get(7)?,
                        expected_profit_pct: dec(row.get(8)?),
                        consumed: row.get(9)?,
                        discovered_at: timestamp(row.get(10)?),
                    })
                },
            )
            .optional()?;
        Ok(opportunity)
    }

    async fn mark_consumed(&self, opportunity_id: &str) -> Result<()> {
        let updated = self.lock()?.execute(
            "UPDATE opportunities SET consumed = 1 WHERE id = ?1 AND consumed = 0",
            params![opportunity_id],
        )?;
        if updated == 0 {
            bail!("opportunity {} not found or already consumed", opportunity_id);
        }
        Ok(())
    }
}
