//! # Inspection Repository
//!
//! The shared authoritative store: one [`InspectionState`] per cell.
//!
//! ## Revision Counter
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  every write sets   revision = MAX(revision) + 1                        │
//! │                                                                         │
//! │  upsert A01-01-01-A  ──►  revision 1                                   │
//! │  upsert A01-01-02-A  ──►  revision 2                                   │
//! │  upsert A01-01-01-A  ──►  revision 3   (row updated in place)          │
//! │                                                                         │
//! │  revision() == 3  ←  watchers compare this number between polls        │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use chrono::Utc;
use sqlx::{Row, SqliteConnection, SqlitePool};
use tracing::{debug, info};

use cellsync_core::{CellAddress, CellRecord, CoreError, InspectionState};

use crate::error::DbResult;

/// Repository for the `cell_inspections` table.
#[derive(Debug, Clone)]
pub struct InspectionRepository {
    pool: SqlitePool,
}

impl InspectionRepository {
    /// Creates a new InspectionRepository.
    pub fn new(pool: SqlitePool) -> Self {
        InspectionRepository { pool }
    }

    /// State of one cell, `None` if the cell was never written.
    pub async fn get(&self, address: &CellAddress) -> DbResult<Option<InspectionState>> {
        let mut conn = self.pool.acquire().await?;
        get_on(&mut conn, address).await
    }

    /// Writes the state of one cell and returns the new store revision.
    pub async fn upsert(&self, address: &CellAddress, state: &InspectionState) -> DbResult<i64> {
        let mut conn = self.pool.acquire().await?;
        upsert_on(&mut conn, address, state).await
    }

    /// Reads a cell, lets `update` compute its next state and writes it back
    /// in one transaction. Returns the written state and the new revision.
    ///
    /// A concurrent writer to the same database makes one of the two
    /// transactions fail instead of silently overwriting the other.
    pub async fn update_with<F>(
        &self,
        address: &CellAddress,
        update: F,
    ) -> DbResult<(InspectionState, i64)>
    where
        F: FnOnce(Option<InspectionState>) -> InspectionState + Send,
    {
        let mut tx = self.pool.begin().await?;
        let current = get_on(&mut tx, address).await?;
        let state = update(current);
        let revision = upsert_on(&mut tx, address, &state).await?;
        tx.commit().await?;
        Ok((state, revision))
    }

    /// Every cell, ordered by address.
    pub async fn list(&self) -> DbResult<Vec<(CellAddress, InspectionState)>> {
        let rows = sqlx::query("SELECT address, state FROM cell_inspections ORDER BY address")
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(decode_row).collect()
    }

    /// Cells of one alley, ordered by address.
    pub async fn list_alley(&self, alley: &str) -> DbResult<Vec<(CellAddress, InspectionState)>> {
        let rows = sqlx::query(
            "SELECT address, state FROM cell_inspections WHERE alley = ?1 ORDER BY address",
        )
        .bind(alley.to_uppercase())
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(decode_row).collect()
    }

    /// Number of stored cells.
    pub async fn count(&self) -> DbResult<i64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM cell_inspections")
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }

    /// Current store revision (0 for an empty store).
    pub async fn revision(&self) -> DbResult<i64> {
        let revision: i64 =
            sqlx::query_scalar("SELECT COALESCE(MAX(revision), 0) FROM cell_inspections")
                .fetch_one(&self.pool)
                .await?;
        Ok(revision)
    }

    /// Bulk import of ingested records in one transaction.
    ///
    /// New cells are seeded from the record. Existing cells get the record's
    /// system status and expected manifest while their inspection fields are
    /// kept, and their article validation is recomputed.
    pub async fn import<'a>(
        &self,
        records: impl IntoIterator<Item = &'a CellRecord>,
    ) -> DbResult<usize> {
        let mut tx = self.pool.begin().await?;
        let mut imported = 0;

        for record in records {
            let state = match get_on(&mut tx, &record.address).await? {
                Some(mut existing) => {
                    existing.system_status = record.system_status;
                    existing.expected_manifest = record.expected_manifest.clone();
                    existing.revalidate();
                    existing
                }
                None => InspectionState::from_record(record),
            };
            upsert_on(&mut tx, &record.address, &state).await?;
            imported += 1;
        }

        tx.commit().await?;
        info!(count = imported, "Imported cell records");
        Ok(imported)
    }
}

async fn get_on(
    conn: &mut SqliteConnection,
    address: &CellAddress,
) -> DbResult<Option<InspectionState>> {
    let state: Option<String> =
        sqlx::query_scalar("SELECT state FROM cell_inspections WHERE address = ?1")
            .bind(address.to_string())
            .fetch_optional(&mut *conn)
            .await?;

    Ok(state.map(|json| serde_json::from_str(&json)).transpose()?)
}

async fn upsert_on(
    conn: &mut SqliteConnection,
    address: &CellAddress,
    state: &InspectionState,
) -> DbResult<i64> {
    let json = serde_json::to_string(state)?;

    let revision: i64 = sqlx::query_scalar(
        r#"
        INSERT INTO cell_inspections (address, alley, state, revision, updated_at)
        VALUES (
            ?1, ?2, ?3,
            (SELECT COALESCE(MAX(revision), 0) + 1 FROM cell_inspections),
            ?4
        )
        ON CONFLICT(address) DO UPDATE SET
            state = excluded.state,
            revision = excluded.revision,
            updated_at = excluded.updated_at
        RETURNING revision
        "#,
    )
    .bind(address.to_string())
    .bind(address.alley())
    .bind(json)
    .bind(Utc::now())
    .fetch_one(&mut *conn)
    .await?;

    debug!(address = %address, revision, "Stored inspection state");
    Ok(revision)
}

fn decode_row(row: &sqlx::sqlite::SqliteRow) -> DbResult<(CellAddress, InspectionState)> {
    let address: String = row.try_get("address")?;
    let state: String = row.try_get("state")?;
    let address = CellAddress::parse(&address).map_err(CoreError::from)?;
    Ok((address, serde_json::from_str(&state)?))
}

// =============================================================================
// Unit Tests
// =============================================================================
