//! SQLite order store.
//!
//! Key properties:
//! - WAL mode for concurrent reads during writes
//! - Prepared statement caching on every hot-path query
//! - Velocity counting served by the (strategy_id, created_at) index
//! - Schema kept in one batch constant, separate from execution queries

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, TimeZone, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OpenFlags, OptionalExtension};
use rust_decimal::Decimal;
use tracing::warn;

use crate::instrument::CanonicalId;
use crate::orders::{
    ExecAlgorithm, Fill, Operation, Order, OrderStatus, OrderType, Side, TimeInForce, VenueKind,
};

const SCHEMA_SQL: &str = r#"
PRAGMA journal_mode = WAL;
PRAGMA synchronous = NORMAL;
PRAGMA cache_size = -64000;
PRAGMA temp_store = MEMORY;

CREATE TABLE IF NOT EXISTS orders (
    operation_id TEXT PRIMARY KEY,
    operation TEXT NOT NULL,
    canonical_id TEXT NOT NULL,
    venue TEXT,
    venue_kind TEXT,
    venue_order_id TEXT,
    side TEXT NOT NULL,
    quantity TEXT NOT NULL,
    price TEXT,
    order_type TEXT NOT NULL,
    time_in_force TEXT,
    exec_algorithm TEXT,
    exec_algorithm_params TEXT,
    status TEXT NOT NULL,
    expected_deltas TEXT,
    atomic_group_id TEXT,
    sequence_in_group INTEGER,
    parent_operation_id TEXT,
    odds TEXT,
    selection TEXT,
    potential_payout TEXT,
    rejection_reason TEXT,
    error_message TEXT,
    strategy_id TEXT NOT NULL,
    created_at INTEGER NOT NULL,
    updated_at INTEGER NOT NULL
) WITHOUT ROWID;

CREATE INDEX IF NOT EXISTS idx_orders_strategy_created
    ON orders(strategy_id, created_at);

CREATE INDEX IF NOT EXISTS idx_orders_status_strategy
    ON orders(status, strategy_id);

CREATE INDEX IF NOT EXISTS idx_orders_venue_status
    ON orders(venue, status);

CREATE INDEX IF NOT EXISTS idx_orders_canonical
    ON orders(canonical_id);

CREATE INDEX IF NOT EXISTS idx_orders_group
    ON orders(atomic_group_id) WHERE atomic_group_id IS NOT NULL;

-- Event application resolves records by the venue's own order id.
CREATE INDEX IF NOT EXISTS idx_orders_venue_order
    ON orders(venue, venue_order_id) WHERE venue_order_id IS NOT NULL;

CREATE TABLE IF NOT EXISTS fills (
    fill_id TEXT PRIMARY KEY,
    operation_id TEXT NOT NULL,
    venue_fill_id TEXT,
    quantity TEXT NOT NULL,
    price TEXT NOT NULL,
    fee TEXT NOT NULL,
    timestamp INTEGER NOT NULL
) WITHOUT ROWID;

CREATE INDEX IF NOT EXISTS idx_fills_operation
    ON fills(operation_id);

-- Re-delivered venue fills must be no-ops.
CREATE UNIQUE INDEX IF NOT EXISTS idx_fills_venue_fill
    ON fills(operation_id, venue_fill_id) WHERE venue_fill_id IS NOT NULL;

CREATE TABLE IF NOT EXISTS positions (
    position_key TEXT PRIMARY KEY,
    base_asset TEXT NOT NULL,
    aggregated_quantity TEXT NOT NULL,
    per_venue_json TEXT NOT NULL,
    per_venue_kind_json TEXT NOT NULL,
    avg_entry_price TEXT,
    last_mark_price TEXT,
    realized_pnl TEXT,
    unrealized_pnl TEXT,
    updated_at INTEGER NOT NULL
) WITHOUT ROWID;

CREATE INDEX IF NOT EXISTS idx_positions_base
    ON positions(base_asset);
"#;

/// Mutable fields that may ride along with a status transition.
#[derive(Debug, Default, Clone)]
pub struct StatusContext {
    pub venue: Option<String>,
    pub venue_kind: Option<VenueKind>,
    pub venue_order_id: Option<String>,
    pub rejection_reason: Option<String>,
    pub error_message: Option<String>,
}

/// Outcome of a fill append attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FillAppend {
    Inserted,
    /// Same (operation_id, venue_fill_id) already recorded; mutation was a no-op.
    Duplicate,
}

/// Durable position row, owned by the position tracker.
#[derive(Debug, Clone, serde::Serialize)]
pub struct PositionRecord {
    pub position_key: String,
    pub base_asset: String,
    pub aggregated_quantity: Decimal,
    pub per_venue_quantity: HashMap<String, Decimal>,
    pub per_venue_kind: HashMap<String, VenueKind>,
    pub avg_entry_price: Option<Decimal>,
    pub last_mark_price: Option<Decimal>,
    pub realized_pnl: Option<Decimal>,
    pub unrealized_pnl: Option<Decimal>,
    pub updated_at: DateTime<Utc>,
}

pub struct OmsStore {
    conn: Arc<Mutex<Connection>>,
}

impl OmsStore {
    pub fn new(db_path: &str) -> Result<Self> {
        let flags = OpenFlags::SQLITE_OPEN_READ_WRITE
            | OpenFlags::SQLITE_OPEN_CREATE
            | OpenFlags::SQLITE_OPEN_NO_MUTEX; // We handle our own locking
        let conn = Connection::open_with_flags(db_path, flags)
            .with_context(|| format!("Failed to open database at {}", db_path))?;
        Self::init(conn)
    }

    /// Private scratch database, used by tests and dry runs.
    pub fn in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.execute_batch(SCHEMA_SQL)
            .context("Failed to initialize order schema")?;

        let journal_mode: String = conn
            .query_row("PRAGMA journal_mode", [], |row| row.get(0))
            .unwrap_or_default();
        if journal_mode.to_lowercase() != "wal" && journal_mode.to_lowercase() != "memory" {
            warn!("WAL mode not active, journal_mode = {}", journal_mode);
        }

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Insert a new record. Returns false when the operation_id already
    /// exists (idempotency hit) and leaves the existing row untouched.
    pub fn insert_order(&self, order: &Order) -> Result<bool> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "INSERT OR IGNORE INTO orders (
                operation_id, operation, canonical_id, venue, venue_kind,
                venue_order_id, side, quantity, price, order_type,
                time_in_force, exec_algorithm, exec_algorithm_params, status,
                expected_deltas, atomic_group_id, sequence_in_group,
                parent_operation_id, odds, selection, potential_payout,
                rejection_reason, error_message, strategy_id, created_at, updated_at
            ) VALUES (
                ?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14,
                ?15, ?16, ?17, ?18, ?19, ?20, ?21, ?22, ?23, ?24, ?25, ?26
            )",
        )?;

        let inserted = stmt.execute(params![
            order.operation_id,
            order.operation.as_str(),
            order.canonical_id.render(),
            order.venue,
            order.venue_kind.map(|k| k.as_str()),
            order.venue_order_id,
            order.side.as_str(),
            order.quantity.to_string(),
            order.price.map(|p| p.to_string()),
            order.order_type.as_str(),
            order.time_in_force.map(|t| t.as_str()),
            order.exec_algorithm.map(|a| a.as_str()),
            order
                .exec_algorithm_params
                .as_ref()
                .map(|p| p.to_string()),
            order.status.as_str(),
            order
                .expected_deltas
                .as_ref()
                .map(|d| serde_json::to_string(d))
                .transpose()?,
            order.atomic_group_id,
            order.sequence_in_group,
            order.parent_operation_id,
            order.odds.map(|o| o.to_string()),
            order.selection,
            order.potential_payout.map(|p| p.to_string()),
            order.rejection_reason,
            order.error_message,
            order.strategy_id,
            order.created_at.timestamp_millis(),
            order.updated_at.timestamp_millis(),
        ])?;

        Ok(inserted > 0)
    }

    pub fn get_order(&self, operation_id: &str) -> Result<Option<Order>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached("SELECT * FROM orders WHERE operation_id = ?1")?;
        let order = stmt
            .query_row(params![operation_id], order_from_row)
            .optional()?;

        match order {
            Some(mut order) => {
                order.fills = Self::fills_for(&conn, operation_id)?;
                Ok(Some(order))
            }
            None => Ok(None),
        }
    }

    pub fn find_by_venue_order_id(
        &self,
        venue: &str,
        venue_order_id: &str,
    ) -> Result<Option<Order>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT * FROM orders WHERE venue = ?1 AND venue_order_id = ?2",
        )?;
        let order = stmt
            .query_row(params![venue, venue_order_id], order_from_row)
            .optional()?;

        match order {
            Some(mut order) => {
                order.fills = Self::fills_for(&conn, &order.operation_id)?;
                Ok(Some(order))
            }
            None => Ok(None),
        }
    }

    /// Apply a status transition plus its context fields in one transaction.
    pub fn update_status(
        &self,
        operation_id: &str,
        status: OrderStatus,
        ctx: &StatusContext,
    ) -> Result<()> {
        let now = Utc::now().timestamp_millis();
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "UPDATE orders SET
                status = ?2,
                venue = COALESCE(?3, venue),
                venue_kind = COALESCE(?4, venue_kind),
                venue_order_id = COALESCE(?5, venue_order_id),
                rejection_reason = COALESCE(?6, rejection_reason),
                error_message = COALESCE(?7, error_message),
                updated_at = MAX(?8, updated_at + 1)
             WHERE operation_id = ?1",
        )?;
        let changed = stmt.execute(params![
            operation_id,
            status.as_str(),
            ctx.venue,
            ctx.venue_kind.map(|k| k.as_str()),
            ctx.venue_order_id,
            ctx.rejection_reason,
            ctx.error_message,
            now,
        ])?;
        if changed == 0 {
            return Err(anyhow!("no order with operation_id {}", operation_id));
        }
        Ok(())
    }

    pub fn set_error_message(&self, operation_id: &str, message: &str) -> Result<()> {
        let now = Utc::now().timestamp_millis();
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "UPDATE orders SET error_message = ?2, updated_at = MAX(?3, updated_at + 1)
             WHERE operation_id = ?1",
        )?;
        stmt.execute(params![operation_id, message, now])?;
        Ok(())
    }

    /// Append a fill. Duplicate venue fill ids are swallowed (no-op) so that
    /// event re-delivery and reconnect snapshots cannot double-count.
    pub fn append_fill(&self, operation_id: &str, fill: &Fill) -> Result<FillAppend> {
        let now = Utc::now().timestamp_millis();
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;

        if let Some(venue_fill_id) = &fill.venue_fill_id {
            let exists: Option<String> = tx
                .prepare_cached(
                    "SELECT fill_id FROM fills WHERE operation_id = ?1 AND venue_fill_id = ?2",
                )?
                .query_row(params![operation_id, venue_fill_id], |row| row.get(0))
                .optional()?;
            if exists.is_some() {
                return Ok(FillAppend::Duplicate);
            }
        }

        tx.prepare_cached(
            "INSERT INTO fills (fill_id, operation_id, venue_fill_id, quantity, price, fee, timestamp)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        )?
        .execute(params![
            fill.fill_id,
            operation_id,
            fill.venue_fill_id,
            fill.quantity.to_string(),
            fill.price.to_string(),
            fill.fee.to_string(),
            fill.timestamp.timestamp_millis(),
        ])?;

        tx.prepare_cached(
            "UPDATE orders SET updated_at = MAX(?2, updated_at + 1) WHERE operation_id = ?1",
        )?
        .execute(params![operation_id, now])?;

        tx.commit()?;
        Ok(FillAppend::Inserted)
    }

    /// Orders created by `strategy_id` at or after `since`. Served by the
    /// (strategy_id, created_at) index; this is the risk velocity hot path.
    pub fn count_since(&self, strategy_id: &str, since: DateTime<Utc>) -> Result<u32> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT COUNT(*) FROM orders WHERE strategy_id = ?1 AND created_at >= ?2",
        )?;
        let count: u32 = stmt.query_row(params![strategy_id, since.timestamp_millis()], |row| {
            row.get(0)
        })?;
        Ok(count)
    }

    pub fn orders_by_group(&self, atomic_group_id: &str) -> Result<Vec<Order>> {
        self.query_many(
            "SELECT * FROM orders WHERE atomic_group_id = ?1
             ORDER BY sequence_in_group ASC",
            params![atomic_group_id],
        )
    }

    pub fn orders_by_parent(&self, parent_operation_id: &str) -> Result<Vec<Order>> {
        self.query_many(
            "SELECT * FROM orders WHERE parent_operation_id = ?1 ORDER BY created_at ASC",
            params![parent_operation_id],
        )
    }

    /// Non-terminal orders routed to `venue`. Used for reconciliation.
    pub fn open_orders_for_venue(&self, venue: &str) -> Result<Vec<Order>> {
        self.query_many(
            "SELECT * FROM orders WHERE venue = ?1
               AND status IN ('PENDING', 'SUBMITTED', 'PARTIALLY_FILLED')
             ORDER BY created_at ASC",
            params![venue],
        )
    }

    pub fn orders_by_status(&self, status: OrderStatus) -> Result<Vec<Order>> {
        self.query_many(
            "SELECT * FROM orders WHERE status = ?1 ORDER BY created_at ASC",
            params![status.as_str()],
        )
    }

    /// Most recent fill price observed for an instrument, the tail of the
    /// mark-price chain.
    pub fn last_fill_price(&self, canonical_id: &CanonicalId) -> Result<Option<Decimal>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT f.price FROM fills f
             JOIN orders o ON o.operation_id = f.operation_id
             WHERE o.canonical_id = ?1
             ORDER BY f.timestamp DESC LIMIT 1",
        )?;
        let price: Option<String> = stmt
            .query_row(params![canonical_id.render()], |row| row.get(0))
            .optional()?;
        price
            .map(|p| parse_decimal(&p, "fill price"))
            .transpose()
    }

    fn query_many(
        &self,
        sql: &str,
        params: impl rusqlite::Params,
    ) -> Result<Vec<Order>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(sql)?;
        let mut orders: Vec<Order> = stmt
            .query_map(params, order_from_row)?
            .collect::<std::result::Result<_, _>>()?;
        for order in &mut orders {
            let operation_id = order.operation_id.clone();
            order.fills = Self::fills_for(&conn, &operation_id)?;
        }
        Ok(orders)
    }

    fn fills_for(conn: &Connection, operation_id: &str) -> Result<Vec<Fill>> {
        let mut stmt = conn.prepare_cached(
            "SELECT fill_id, venue_fill_id, quantity, price, fee, timestamp
             FROM fills WHERE operation_id = ?1 ORDER BY timestamp ASC, fill_id ASC",
        )?;
        let fills = stmt
            .query_map(params![operation_id], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, Option<String>>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, String>(4)?,
                    row.get::<_, i64>(5)?,
                ))
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        fills
            .into_iter()
            .map(|(fill_id, venue_fill_id, quantity, price, fee, ts)| {
                Ok(Fill {
                    fill_id,
                    venue_fill_id,
                    quantity: parse_decimal(&quantity, "fill quantity")?,
                    price: parse_decimal(&price, "fill price")?,
                    fee: parse_decimal(&fee, "fill fee")?,
                    timestamp: millis_to_utc(ts),
                })
            })
            .collect()
    }

    // ------------------------------------------------------------------
    // Positions
    // ------------------------------------------------------------------

    pub fn upsert_position(&self, record: &PositionRecord) -> Result<()> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "INSERT INTO positions (
                position_key, base_asset, aggregated_quantity, per_venue_json,
                per_venue_kind_json, avg_entry_price, last_mark_price,
                realized_pnl, unrealized_pnl, updated_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
            ON CONFLICT(position_key) DO UPDATE SET
                base_asset = excluded.base_asset,
                aggregated_quantity = excluded.aggregated_quantity,
                per_venue_json = excluded.per_venue_json,
                per_venue_kind_json = excluded.per_venue_kind_json,
                avg_entry_price = excluded.avg_entry_price,
                last_mark_price = excluded.last_mark_price,
                realized_pnl = excluded.realized_pnl,
                unrealized_pnl = excluded.unrealized_pnl,
                updated_at = MAX(excluded.updated_at, positions.updated_at + 1)",
        )?;

        let per_venue: HashMap<&str, String> = record
            .per_venue_quantity
            .iter()
            .map(|(venue, qty)| (venue.as_str(), qty.to_string()))
            .collect();
        let per_kind: HashMap<&str, &str> = record
            .per_venue_kind
            .iter()
            .map(|(venue, kind)| (venue.as_str(), kind.as_str()))
            .collect();

        stmt.execute(params![
            record.position_key,
            record.base_asset,
            record.aggregated_quantity.to_string(),
            serde_json::to_string(&per_venue)?,
            serde_json::to_string(&per_kind)?,
            record.avg_entry_price.map(|p| p.to_string()),
            record.last_mark_price.map(|p| p.to_string()),
            record.realized_pnl.map(|p| p.to_string()),
            record.unrealized_pnl.map(|p| p.to_string()),
            record.updated_at.timestamp_millis(),
        ])?;
        Ok(())
    }

    pub fn load_positions(&self) -> Result<Vec<PositionRecord>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached("SELECT * FROM positions")?;
        let rows = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, String>("position_key")?,
                    row.get::<_, String>("base_asset")?,
                    row.get::<_, String>("aggregated_quantity")?,
                    row.get::<_, String>("per_venue_json")?,
                    row.get::<_, String>("per_venue_kind_json")?,
                    row.get::<_, Option<String>>("avg_entry_price")?,
                    row.get::<_, Option<String>>("last_mark_price")?,
                    row.get::<_, Option<String>>("realized_pnl")?,
                    row.get::<_, Option<String>>("unrealized_pnl")?,
                    row.get::<_, i64>("updated_at")?,
                ))
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        rows.into_iter()
            .map(
                |(key, base, agg, venues, kinds, avg, mark, realized, unrealized, ts)| {
                    let per_venue_raw: HashMap<String, String> = serde_json::from_str(&venues)?;
                    let per_venue_quantity = per_venue_raw
                        .into_iter()
                        .map(|(venue, qty)| Ok((venue, parse_decimal(&qty, "venue quantity")?)))
                        .collect::<Result<HashMap<_, _>>>()?;
                    let per_kind_raw: HashMap<String, String> = serde_json::from_str(&kinds)?;
                    let per_venue_kind = per_kind_raw
                        .into_iter()
                        .filter_map(|(venue, kind)| {
                            VenueKind::parse(&kind).map(|k| (venue, k))
                        })
                        .collect();

                    Ok(PositionRecord {
                        position_key: key,
                        base_asset: base,
                        aggregated_quantity: parse_decimal(&agg, "aggregated quantity")?,
                        per_venue_quantity,
                        per_venue_kind,
                        avg_entry_price: avg
                            .map(|p| parse_decimal(&p, "avg entry price"))
                            .transpose()?,
                        last_mark_price: mark
                            .map(|p| parse_decimal(&p, "mark price"))
                            .transpose()?,
                        realized_pnl: realized
                            .map(|p| parse_decimal(&p, "realized pnl"))
                            .transpose()?,
                        unrealized_pnl: unrealized
                            .map(|p| parse_decimal(&p, "unrealized pnl"))
                            .transpose()?,
                        updated_at: millis_to_utc(ts),
                    })
                },
            )
            .collect()
    }
}

fn parse_decimal(raw: &str, what: &str) -> Result<Decimal> {
    raw.parse::<Decimal>()
        .map_err(|e| anyhow!("corrupt {} '{}': {}", what, raw, e))
}

fn millis_to_utc(millis: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(millis)
        .single()
        .unwrap_or_else(Utc::now)
}

fn order_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Order> {
    let text = |idx: &str| -> rusqlite::Result<String> { row.get(idx) };
    let opt = |idx: &str| -> rusqlite::Result<Option<String>> { row.get(idx) };

    let invalid = |what: &str, value: String| {
        rusqlite::Error::FromSqlConversionFailure(
            0,
            rusqlite::types::Type::Text,
            format!("corrupt {what}: '{value}'").into(),
        )
    };

    let canonical_raw = text("canonical_id")?;
    let canonical_id = CanonicalId::parse(&canonical_raw)
        .map_err(|_| invalid("canonical_id", canonical_raw.clone()))?;

    let operation_raw = text("operation")?;
    let operation =
        Operation::parse(&operation_raw).ok_or_else(|| invalid("operation", operation_raw))?;

    let side_raw = text("side")?;
    let side = Side::parse(&side_raw).ok_or_else(|| invalid("side", side_raw))?;

    let order_type_raw = text("order_type")?;
    let order_type =
        OrderType::parse(&order_type_raw).ok_or_else(|| invalid("order_type", order_type_raw))?;

    let status_raw = text("status")?;
    let status = OrderStatus::parse(&status_raw).ok_or_else(|| invalid("status", status_raw))?;

    let parse_dec = |what: &str, value: String| {
        value
            .parse::<Decimal>()
            .map_err(|_| invalid(what, value.clone()))
    };

    let quantity = parse_dec("quantity", text("quantity")?)?;
    let price = opt("price")?.map(|p| parse_dec("price", p)).transpose()?;
    let odds = opt("odds")?.map(|o| parse_dec("odds", o)).transpose()?;
    let potential_payout = opt("potential_payout")?
        .map(|p| parse_dec("potential_payout", p))
        .transpose()?;

    let expected_deltas = opt("expected_deltas")?
        .map(|raw| {
            serde_json::from_str::<HashMap<String, Decimal>>(&raw)
                .map_err(|_| invalid("expected_deltas", raw.clone()))
        })
        .transpose()?;

    let exec_algorithm_params = opt("exec_algorithm_params")?
        .map(|raw| {
            serde_json::from_str::<serde_json::Value>(&raw)
                .map_err(|_| invalid("exec_algorithm_params", raw.clone()))
        })
        .transpose()?;

    Ok(Order {
        operation_id: text("operation_id")?,
        operation,
        canonical_id,
        venue: opt("venue")?,
        venue_kind: opt("venue_kind")?.and_then(|k| VenueKind::parse(&k)),
        venue_order_id: opt("venue_order_id")?,
        side,
        quantity,
        price,
        order_type,
        time_in_force: opt("time_in_force")?.and_then(|t| TimeInForce::parse(&t)),
        exec_algorithm: opt("exec_algorithm")?.and_then(|a| ExecAlgorithm::parse(&a)),
        exec_algorithm_params,
        status,
        fills: Vec::new(),
        expected_deltas,
        atomic_group_id: opt("atomic_group_id")?,
        sequence_in_group: row.get::<_, Option<u32>>("sequence_in_group")?,
        parent_operation_id: opt("parent_operation_id")?,
        odds,
        selection: opt("selection")?,
        potential_payout,
        rejection_reason: opt("rejection_reason")?,
        error_message: opt("error_message")?,
        strategy_id: text("strategy_id")?,
        created_at: millis_to_utc(row.get::<_, i64>("created_at")?),
        updated_at: millis_to_utc(row.get::<_, i64>("updated_at")?),
    })
}
