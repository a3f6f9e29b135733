use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use rusqlite::{
    params, params_from_iter, Connection, DatabaseName, OptionalExtension, Params, Row,
    TransactionBehavior,
};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use yard_inventory_core::{
    normalize_field, LegacyFieldCounts, MigrationPhase, MigrationRun, RunOutcome, Shipment,
    ShipmentId, Vessel, VesselId,
};

const LATEST_SCHEMA_VERSION: i64 = 2;

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Keeps every bulk statement well under SQLite's bound-parameter limit.
const UPDATE_CHUNK_SIZE: usize = 500;

const CREATE_SCHEMA_MIGRATIONS_SQL: &str = r"
CREATE TABLE IF NOT EXISTS schema_migrations (
  version INTEGER PRIMARY KEY,
  applied_at TEXT NOT NULL
);
";

const MIGRATION_001_SQL: &str = r"
CREATE TABLE IF NOT EXISTS shipments (
  shipment_id TEXT PRIMARY KEY,
  vessel_name TEXT,
  job_number TEXT,
  pod TEXT,
  vessel_id TEXT,
  created_at TEXT NOT NULL,
  updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS vessels (
  vessel_id TEXT PRIMARY KEY,
  vessel_name TEXT NOT NULL CHECK (length(trim(vessel_name)) > 0),
  job_number TEXT,
  pod TEXT,
  etd TEXT,
  shipping_line TEXT,
  created_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_shipments_vessel_id ON shipments(vessel_id);
CREATE INDEX IF NOT EXISTS idx_shipments_vessel_name ON shipments(vessel_name);
CREATE INDEX IF NOT EXISTS idx_vessels_vessel_name ON vessels(vessel_name);
";

const MIGRATION_002_SQL: &str = r"
CREATE UNIQUE INDEX IF NOT EXISTS idx_vessels_identity
  ON vessels(vessel_name, COALESCE(job_number, ''));

CREATE TABLE IF NOT EXISTS migration_runs (
  run_id TEXT PRIMARY KEY,
  phase TEXT NOT NULL CHECK (phase IN ('analyze','execute','verify','rollback','cleanup')),
  dry_run INTEGER NOT NULL CHECK (dry_run IN (0, 1)),
  started_at TEXT NOT NULL,
  finished_at TEXT NOT NULL,
  outcome TEXT NOT NULL CHECK (outcome IN ('completed','completed_with_errors','refused')),
  vessels_created INTEGER NOT NULL CHECK (vessels_created >= 0),
  shipments_updated INTEGER NOT NULL CHECK (shipments_updated >= 0),
  error_count INTEGER NOT NULL CHECK (error_count >= 0),
  detail_json TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_migration_runs_started_at ON migration_runs(started_at);
";

const SHIPMENT_COLUMNS: &str =
    "shipment_id, vessel_name, job_number, pod, vessel_id, created_at, updated_at";

const VESSEL_COLUMNS: &str =
    "vessel_id, vessel_name, job_number, pod, etd, shipping_line, created_at";

// Shipments still carrying a usable legacy name and no reference yet.
const UNMIGRATED_PREDICATE: &str =
    "vessel_id IS NULL AND vessel_name IS NOT NULL AND TRIM(vessel_name) <> ''";

pub struct SqliteStore {
    conn: Connection,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SchemaStatus {
    pub current_version: i64,
    pub target_version: i64,
    pub pending_versions: Vec<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ForeignKeyViolation {
    pub table: String,
    pub rowid: i64,
    pub parent: String,
    pub fk_index: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct IntegrityReport {
    pub quick_check_ok: bool,
    pub quick_check_message: String,
    pub foreign_key_violations: Vec<ForeignKeyViolation>,
    pub schema_status: SchemaStatus,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ShipmentStateCounts {
    pub total: u64,
    pub unmigrated: u64,
    pub migrated: u64,
    pub vessel_free: u64,
}

/// One migrated shipment joined to whatever its `vessel_id` resolves to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SampledLink {
    pub shipment_id: ShipmentId,
    pub vessel_id: VesselId,
    pub shipment_vessel_name: Option<String>,
    pub linked_vessel_name: Option<String>,
}

impl SqliteStore {
    /// Open a SQLite-backed inventory store and configure required runtime pragmas.
    ///
    /// # Errors
    /// Returns an error when the database cannot be opened or pragmas cannot be applied.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open sqlite database at {}", path.display()))?;

        // The WAL switch can itself contend for the lock on a fresh file.
        conn.busy_timeout(BUSY_TIMEOUT).context("failed to set sqlite busy timeout")?;
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA foreign_keys = ON;",
        )
        .context("failed to configure sqlite pragmas")?;

        Ok(Self { conn })
    }

    /// Report current and target schema versions plus pending migrations.
    ///
    /// # Errors
    /// Returns an error when schema metadata cannot be read or initialized.
    pub fn schema_status(&self) -> Result<SchemaStatus> {
        self.conn
            .execute_batch(CREATE_SCHEMA_MIGRATIONS_SQL)
            .context("failed to apply schema_migrations table")?;
        let current_version = current_schema_version(&self.conn)?;
        let pending_versions = if current_version < LATEST_SCHEMA_VERSION {
            ((current_version + 1)..=LATEST_SCHEMA_VERSION).collect::<Vec<_>>()
        } else {
            Vec::new()
        };

        Ok(SchemaStatus {
            current_version,
            target_version: LATEST_SCHEMA_VERSION,
            pending_versions,
        })
    }

    /// Apply all forward migrations up to the latest supported schema version.
    ///
    /// Pending steps run inside one IMMEDIATE transaction and the version is
    /// re-read after the write lock is held, so connections racing on a fresh
    /// database apply each step exactly once.
    ///
    /// # Errors
    /// Returns an error when migration bootstrapping or any migration step fails.
    pub fn migrate(&mut self) -> Result<()> {
        self.conn
            .execute_batch(CREATE_SCHEMA_MIGRATIONS_SQL)
            .context("failed to apply schema_migrations table")?;

        if current_schema_version(&self.conn)? < LATEST_SCHEMA_VERSION {
            let tx = self
                .conn
                .transaction_with_behavior(TransactionBehavior::Immediate)
                .context("failed to start schema migration transaction")?;
            let mut version = current_schema_version(&tx)?;

            if version < 1 {
                apply_migration_1(&tx)?;
                version = 1;
            }

            if version < 2 {
                apply_migration_2(&tx)?;
            }

            tx.commit().context("failed to commit schema migrations")?;
        }

        let version = current_schema_version(&self.conn)?;
        if version != LATEST_SCHEMA_VERSION {
            return Err(anyhow!(
                "unsupported schema version {version}; expected {LATEST_SCHEMA_VERSION}"
            ));
        }

        Ok(())
    }

    /// Persist one shipment exactly as given. Legacy fields are stored raw so
    /// blank and missing values stay distinguishable in the database.
    ///
    /// # Errors
    /// Returns an error when the insert fails.
    pub fn insert_shipment(&self, shipment: &Shipment) -> Result<()> {
        self.conn
            .execute(
                "INSERT INTO shipments(
                    shipment_id, vessel_name, job_number, pod, vessel_id, created_at, updated_at
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    shipment.shipment_id.to_string(),
                    shipment.vessel_name,
                    shipment.job_number,
                    shipment.pod,
                    shipment.vessel_id.map(|id| id.to_string()),
                    rfc3339(shipment.created_at)?,
                    rfc3339(shipment.updated_at)?,
                ],
            )
            .context("failed to insert shipment")?;
        Ok(())
    }

    /// Load one shipment by id.
    ///
    /// # Errors
    /// Returns an error when the lookup or row decoding fails.
    pub fn get_shipment(&self, shipment_id: ShipmentId) -> Result<Option<Shipment>> {
        let sql = format!("SELECT {SHIPMENT_COLUMNS} FROM shipments WHERE shipment_id = ?1");
        let row = self
            .conn
            .query_row(&sql, params![shipment_id.to_string()], ShipmentRow::from_row)
            .optional()
            .context("failed to load shipment")?;
        row.map(ShipmentRow::into_shipment).transpose()
    }

    /// Load all shipments in creation order.
    ///
    /// # Errors
    /// Returns an error when rows cannot be read or decoded.
    pub fn list_shipments(&self) -> Result<Vec<Shipment>> {
        let sql = format!(
            "SELECT {SHIPMENT_COLUMNS} FROM shipments ORDER BY created_at ASC, shipment_id ASC"
        );
        self.query_shipments(&sql, [])
    }

    /// Load every shipment that still needs a vessel reference.
    ///
    /// The SQL predicate only trims spaces, so rows are re-checked against the
    /// core normalization rule before being returned.
    ///
    /// # Errors
    /// Returns an error when rows cannot be read or decoded.
    pub fn list_unmigrated_shipments(&self) -> Result<Vec<Shipment>> {
        let sql = format!(
            "SELECT {SHIPMENT_COLUMNS} FROM shipments
             WHERE {UNMIGRATED_PREDICATE}
             ORDER BY shipment_id ASC"
        );
        let shipments = self.query_shipments(&sql, [])?;
        Ok(shipments
            .into_iter()
            .filter(|shipment| normalize_field(shipment.vessel_name.as_deref()).is_some())
            .collect())
    }

    /// Count unmigrated shipments. Only the legacy name column is read; it is
    /// checked against the same normalization rule as
    /// [`Self::list_unmigrated_shipments`].
    ///
    /// # Errors
    /// Returns an error when the query fails.
    pub fn count_unmigrated(&self) -> Result<u64> {
        let sql = format!("SELECT vessel_name FROM shipments WHERE {UNMIGRATED_PREDICATE}");
        let mut stmt = self.conn.prepare(&sql)?;
        let mut rows = stmt.query([])?;
        let mut unmigrated = 0_u64;
        while let Some(row) = rows.next()? {
            let vessel_name: Option<String> = row.get(0)?;
            if normalize_field(vessel_name.as_deref()).is_some() {
                unmigrated += 1;
            }
        }
        Ok(unmigrated)
    }

    /// Count shipments per migration state.
    ///
    /// # Errors
    /// Returns an error when any count query fails.
    pub fn shipment_state_counts(&self) -> Result<ShipmentStateCounts> {
        let unmigrated = self.count_unmigrated()?;
        self.shipment_state_counts_with(unmigrated)
    }

    /// Count shipments per migration state when the caller already holds the
    /// unmigrated count, e.g. from [`Self::list_unmigrated_shipments`].
    ///
    /// # Errors
    /// Returns an error when any count query fails.
    pub fn shipment_state_counts_with(&self, unmigrated: u64) -> Result<ShipmentStateCounts> {
        let total = self.count("SELECT COUNT(*) FROM shipments", [])?;
        let migrated = self.count("SELECT COUNT(*) FROM shipments WHERE vessel_id IS NOT NULL", [])?;
        Ok(ShipmentStateCounts {
            total,
            unmigrated,
            migrated,
            vessel_free: total.saturating_sub(migrated + unmigrated),
        })
    }

    /// Set `vessel_id` on the given shipments, skipping any that are no longer
    /// unmigrated. Returns how many shipments actually transitioned.
    ///
    /// # Errors
    /// Returns an error when the update transaction fails; no rows change in that case.
    pub fn assign_vessel(&mut self, vessel_id: VesselId, shipment_ids: &[ShipmentId]) -> Result<u64> {
        let now = now_rfc3339()?;
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .context("failed to start vessel assignment transaction")?;

        let mut updated = 0_usize;
        for chunk in shipment_ids.chunks(UPDATE_CHUNK_SIZE) {
            let placeholders =
                (0..chunk.len()).map(|index| format!("?{}", index + 3)).collect::<Vec<_>>();
            let sql = format!(
                "UPDATE shipments SET vessel_id = ?1, updated_at = ?2
                 WHERE {UNMIGRATED_PREDICATE} AND shipment_id IN ({})",
                placeholders.join(", ")
            );
            let mut values = Vec::with_capacity(chunk.len() + 2);
            values.push(vessel_id.to_string());
            values.push(now.clone());
            values.extend(chunk.iter().map(ToString::to_string));
            updated += tx
                .execute(&sql, params_from_iter(values))
                .context("failed to assign vessel to shipments")?;
        }

        tx.commit().context("failed to commit vessel assignment")?;
        u64::try_from(updated).context("updated row count overflow")
    }

    /// Remove `vessel_id` from every migrated shipment.
    ///
    /// # Errors
    /// Returns an error when the update fails.
    pub fn clear_vessel_refs(&self) -> Result<u64> {
        let updated = self
            .conn
            .execute(
                "UPDATE shipments SET vessel_id = NULL, updated_at = ?1 WHERE vessel_id IS NOT NULL",
                params![now_rfc3339()?],
            )
            .context("failed to clear shipment vessel references")?;
        u64::try_from(updated).context("updated row count overflow")
    }

    /// Count shipments still holding each legacy vessel field.
    ///
    /// # Errors
    /// Returns an error when any count query fails.
    pub fn legacy_field_counts(&self) -> Result<LegacyFieldCounts> {
        Ok(LegacyFieldCounts {
            with_vessel_name: self
                .count("SELECT COUNT(*) FROM shipments WHERE vessel_name IS NOT NULL", [])?,
            with_job_number: self
                .count("SELECT COUNT(*) FROM shipments WHERE job_number IS NOT NULL", [])?,
            with_pod: self.count("SELECT COUNT(*) FROM shipments WHERE pod IS NOT NULL", [])?,
        })
    }

    /// Strip `vessel_name`, `job_number` and `pod` from every shipment.
    ///
    /// # Errors
    /// Returns an error when the update fails.
    pub fn strip_legacy_fields(&self) -> Result<u64> {
        let updated = self
            .conn
            .execute(
                "UPDATE shipments
                 SET vessel_name = NULL, job_number = NULL, pod = NULL, updated_at = ?1
                 WHERE vessel_name IS NOT NULL OR job_number IS NOT NULL OR pod IS NOT NULL",
                params![now_rfc3339()?],
            )
            .context("failed to strip legacy vessel fields")?;
        u64::try_from(updated).context("updated row count overflow")
    }

    /// Insert a vessel unless one with the same `(vessel_name, job_number)`
    /// identity already exists. Returns `true` when a row was inserted.
    ///
    /// # Errors
    /// Returns an error when validation or the insert fails.
    pub fn insert_vessel_if_absent(&self, vessel: &Vessel) -> Result<bool> {
        vessel.validate()?;
        let inserted = self
            .conn
            .execute(
                "INSERT INTO vessels(
                    vessel_id, vessel_name, job_number, pod, etd, shipping_line, created_at
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                ON CONFLICT DO NOTHING",
                params![
                    vessel.vessel_id.to_string(),
                    vessel.vessel_name,
                    vessel.job_number,
                    vessel.pod,
                    vessel.etd.map(rfc3339).transpose()?,
                    vessel.shipping_line,
                    rfc3339(vessel.created_at)?,
                ],
            )
            .context("failed to insert vessel")?;
        Ok(inserted == 1)
    }

    /// Find the vessel for a normalized `(vessel_name, job_number)` identity.
    /// A `None` job number matches vessels whose job number is null or empty.
    ///
    /// # Errors
    /// Returns an error when the lookup or row decoding fails.
    pub fn find_vessel_by_identity(
        &self,
        vessel_name: &str,
        job_number: Option<&str>,
    ) -> Result<Option<Vessel>> {
        let sql = format!(
            "SELECT {VESSEL_COLUMNS} FROM vessels
             WHERE vessel_name = ?1 AND COALESCE(job_number, '') = ?2"
        );
        let row = self
            .conn
            .query_row(&sql, params![vessel_name, job_number.unwrap_or("")], VesselRow::from_row)
            .optional()
            .context("failed to look up vessel identity")?;
        row.map(VesselRow::into_vessel).transpose()
    }

    /// Load one vessel by id.
    ///
    /// # Errors
    /// Returns an error when the lookup or row decoding fails.
    pub fn get_vessel(&self, vessel_id: VesselId) -> Result<Option<Vessel>> {
        let sql = format!("SELECT {VESSEL_COLUMNS} FROM vessels WHERE vessel_id = ?1");
        let row = self
            .conn
            .query_row(&sql, params![vessel_id.to_string()], VesselRow::from_row)
            .optional()
            .context("failed to load vessel")?;
        row.map(VesselRow::into_vessel).transpose()
    }

    /// Load all vessels ordered by identity.
    ///
    /// # Errors
    /// Returns an error when rows cannot be read or decoded.
    pub fn list_vessels(&self) -> Result<Vec<Vessel>> {
        let sql = format!(
            "SELECT {VESSEL_COLUMNS} FROM vessels
             ORDER BY vessel_name ASC, COALESCE(job_number, '') ASC, vessel_id ASC"
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map([], VesselRow::from_row)?;
        let mut vessels = Vec::new();
        for row in rows {
            vessels.push(row?.into_vessel()?);
        }
        Ok(vessels)
    }

    /// # Errors
    /// Returns an error when the count query fails.
    pub fn count_vessels(&self) -> Result<u64> {
        self.count("SELECT COUNT(*) FROM vessels", [])
    }

    /// Number of distinct vessel ids referenced by migrated shipments.
    ///
    /// # Errors
    /// Returns an error when the count query fails.
    pub fn count_referenced_vessel_ids(&self) -> Result<u64> {
        self.count(
            "SELECT COUNT(DISTINCT vessel_id) FROM shipments WHERE vessel_id IS NOT NULL",
            [],
        )
    }

    /// Referenced vessel ids that resolve to no vessel row.
    ///
    /// # Errors
    /// Returns an error when the query fails or a stored id is malformed.
    pub fn orphaned_vessel_ids(&self) -> Result<Vec<VesselId>> {
        let mut stmt = self.conn.prepare(
            "SELECT DISTINCT s.vessel_id
             FROM shipments s
             LEFT JOIN vessels v ON v.vessel_id = s.vessel_id
             WHERE s.vessel_id IS NOT NULL AND v.vessel_id IS NULL
             ORDER BY s.vessel_id ASC",
        )?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
        let mut ids = Vec::new();
        for row in rows {
            ids.push(VesselId::parse(&row?)?);
        }
        Ok(ids)
    }

    /// Draw up to `limit` random migrated shipments joined to their vessel.
    ///
    /// # Errors
    /// Returns an error when the query fails or a stored id is malformed.
    pub fn sample_migrated(&self, limit: u32) -> Result<Vec<SampledLink>> {
        let mut stmt = self.conn.prepare(
            "SELECT s.shipment_id, s.vessel_id, s.vessel_name, v.vessel_name
             FROM shipments s
             LEFT JOIN vessels v ON v.vessel_id = s.vessel_id
             WHERE s.vessel_id IS NOT NULL
             ORDER BY RANDOM()
             LIMIT ?1",
        )?;
        let rows = stmt.query_map(params![i64::from(limit)], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, Option<String>>(2)?,
                row.get::<_, Option<String>>(3)?,
            ))
        })?;

        let mut sampled = Vec::new();
        for row in rows {
            let (shipment_id, vessel_id, shipment_vessel_name, linked_vessel_name) = row?;
            sampled.push(SampledLink {
                shipment_id: ShipmentId::parse(&shipment_id)?,
                vessel_id: VesselId::parse(&vessel_id)?,
                shipment_vessel_name,
                linked_vessel_name,
            });
        }
        Ok(sampled)
    }

    /// Append one migration audit row.
    ///
    /// # Errors
    /// Returns an error when serialization or the insert fails.
    pub fn record_run(&self, run: &MigrationRun) -> Result<()> {
        self.conn
            .execute(
                "INSERT INTO migration_runs(
                    run_id, phase, dry_run, started_at, finished_at, outcome,
                    vessels_created, shipments_updated, error_count, detail_json
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                params![
                    run.run_id,
                    run.phase.as_str(),
                    i64::from(run.dry_run),
                    rfc3339(run.started_at)?,
                    rfc3339(run.finished_at)?,
                    run.outcome.as_str(),
                    i64::try_from(run.vessels_created).context("vessels_created overflow")?,
                    i64::try_from(run.shipments_updated).context("shipments_updated overflow")?,
                    i64::try_from(run.error_count).context("error_count overflow")?,
                    serde_json::to_string(&run.detail).context("failed to serialize run detail")?,
                ],
            )
            .context("failed to record migration run")?;
        Ok(())
    }

    /// List migration audit rows, newest first.
    ///
    /// # Errors
    /// Returns an error when rows cannot be read or decoded.
    pub fn list_runs(&self) -> Result<Vec<MigrationRun>> {
        let mut stmt = self.conn.prepare(
            "SELECT run_id, phase, dry_run, started_at, finished_at, outcome,
                    vessels_created, shipments_updated, error_count, detail_json
             FROM migration_runs
             ORDER BY started_at DESC, run_id DESC",
        )?;
        let mut rows = stmt.query([])?;
        let mut runs = Vec::new();

        while let Some(row) = rows.next()? {
            let phase_raw: String = row.get(1)?;
            let outcome_raw: String = row.get(5)?;
            let detail_json: String = row.get(9)?;
            runs.push(MigrationRun {
                run_id: row.get(0)?,
                phase: MigrationPhase::parse(&phase_raw)
                    .ok_or_else(|| anyhow!("unknown migration phase: {phase_raw}"))?,
                dry_run: row.get::<_, i64>(2)? == 1,
                started_at: parse_rfc3339(&row.get::<_, String>(3)?)?,
                finished_at: parse_rfc3339(&row.get::<_, String>(4)?)?,
                outcome: RunOutcome::parse(&outcome_raw)
                    .ok_or_else(|| anyhow!("unknown run outcome: {outcome_raw}"))?,
                vessels_created: to_count(row.get(6)?)?,
                shipments_updated: to_count(row.get(7)?)?,
                error_count: to_count(row.get(8)?)?,
                detail: serde_json::from_str(&detail_json)
                    .context("failed to deserialize run detail")?,
            });
        }

        Ok(runs)
    }

    /// Create a `SQLite` backup file of the current main database.
    ///
    /// # Errors
    /// Returns an error when backup directories cannot be created or backup fails.
    pub fn backup_database(&self, out_file: &Path) -> Result<()> {
        if let Some(parent) = out_file.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("failed to create parent directory for backup file {}", out_file.display())
            })?;
        }

        self.conn
            .backup(DatabaseName::Main, out_file, None)
            .with_context(|| format!("failed to create sqlite backup at {}", out_file.display()))
    }

    /// Restore this database from a `SQLite` backup file, then migrate to latest.
    ///
    /// # Errors
    /// Returns an error when the backup file is missing, restore fails, or migrations fail.
    pub fn restore_database(&mut self, in_file: &Path) -> Result<()> {
        if !in_file.exists() {
            return Err(anyhow!("backup file does not exist: {}", in_file.display()));
        }

        self.conn
            .restore(DatabaseName::Main, in_file, None::<fn(rusqlite::backup::Progress)>)
            .with_context(|| {
                format!("failed to restore sqlite backup from {}", in_file.display())
            })?;

        self.migrate()?;
        Ok(())
    }

    /// Run quick-check, foreign-key-check, and schema status health probes.
    ///
    /// # Errors
    /// Returns an error when any integrity probe query fails.
    pub fn integrity_check(&self) -> Result<IntegrityReport> {
        let quick_check_message: String = self
            .conn
            .query_row("PRAGMA quick_check", [], |row| row.get::<_, String>(0))
            .context("failed to run PRAGMA quick_check")?;

        let mut stmt = self
            .conn
            .prepare("PRAGMA foreign_key_check")
            .context("failed to prepare PRAGMA foreign_key_check")?;
        let rows = stmt.query_map([], |row| {
            Ok(ForeignKeyViolation {
                table: row.get(0)?,
                rowid: row.get(1)?,
                parent: row.get(2)?,
                fk_index: row.get(3)?,
            })
        })?;

        let mut foreign_key_violations = Vec::new();
        for row in rows {
            foreign_key_violations.push(row?);
        }

        let schema_status = self.schema_status()?;
        Ok(IntegrityReport {
            quick_check_ok: quick_check_message == "ok",
            quick_check_message,
            foreign_key_violations,
            schema_status,
        })
    }

    fn query_shipments<P: Params>(&self, sql: &str, params: P) -> Result<Vec<Shipment>> {
        let mut stmt = self.conn.prepare(sql)?;
        let rows = stmt.query_map(params, ShipmentRow::from_row)?;
        let mut shipments = Vec::new();
        for row in rows {
            shipments.push(row?.into_shipment()?);
        }
        Ok(shipments)
    }

    fn count<P: Params>(&self, sql: &str, params: P) -> Result<u64> {
        let value = self
            .conn
            .query_row(sql, params, |row| row.get::<_, i64>(0))
            .with_context(|| format!("failed to run count query: {sql}"))?;
        to_count(value)
    }
}

#[derive(Debug)]
struct ShipmentRow {
    shipment_id: String,
    vessel_name: Option<String>,
    job_number: Option<String>,
    pod: Option<String>,
    vessel_id: Option<String>,
    created_at: String,
    updated_at: String,
}

impl ShipmentRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            shipment_id: row.get(0)?,
            vessel_name: row.get(1)?,
            job_number: row.get(2)?,
            pod: row.get(3)?,
            vessel_id: row.get(4)?,
            created_at: row.get(5)?,
            updated_at: row.get(6)?,
        })
    }

    fn into_shipment(self) -> Result<Shipment> {
        Ok(Shipment {
            shipment_id: ShipmentId::parse(&self.shipment_id)?,
            vessel_name: self.vessel_name,
            job_number: self.job_number,
            pod: self.pod,
            vessel_id: self.vessel_id.as_deref().map(VesselId::parse).transpose()?,
            created_at: parse_rfc3339(&self.created_at)?,
            updated_at: parse_rfc3339(&self.updated_at)?,
        })
    }
}

#[derive(Debug)]
struct VesselRow {
    vessel_id: String,
    vessel_name: String,
    job_number: Option<String>,
    pod: Option<String>,
    etd: Option<String>,
    shipping_line: Option<String>,
    created_at: String,
}

impl VesselRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            vessel_id: row.get(0)?,
            vessel_name: row.get(1)?,
            job_number: row.get(2)?,
            pod: row.get(3)?,
            etd: row.get(4)?,
            shipping_line: row.get(5)?,
            created_at: row.get(6)?,
        })
    }

    fn into_vessel(self) -> Result<Vessel> {
        Ok(Vessel {
            vessel_id: VesselId::parse(&self.vessel_id)?,
            vessel_name: self.vessel_name,
            job_number: self.job_number,
            pod: self.pod,
            etd: self.etd.as_deref().map(parse_rfc3339).transpose()?,
            shipping_line: self.shipping_line,
            created_at: parse_rfc3339(&self.created_at)?,
        })
    }
}

fn apply_migration_1(conn: &Connection) -> Result<()> {
    conn.execute_batch(MIGRATION_001_SQL).context("failed to apply migration v1")?;
    record_schema_version(conn, 1)?;
    Ok(())
}

fn apply_migration_2(conn: &Connection) -> Result<()> {
    let duplicates = {
        let mut stmt = conn.prepare(
            "SELECT vessel_name, COALESCE(job_number, ''), COUNT(*)
             FROM vessels
             GROUP BY vessel_name, COALESCE(job_number, '')
             HAVING COUNT(*) > 1
             ORDER BY vessel_name ASC",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok(format!(
                "{}/{} x{}",
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, i64>(2)?
            ))
        })?;
        rows.collect::<rusqlite::Result<Vec<_>>>()?
    };

    if !duplicates.is_empty() {
        return Err(anyhow!(
            "cannot apply migration v2: duplicate vessel identities must be merged first: {}",
            duplicates.join(", ")
        ));
    }

    conn.execute_batch(MIGRATION_002_SQL).context("failed to apply migration v2")?;
    record_schema_version(conn, 2)?;
    tracing::debug!("applied schema migration v2");
    Ok(())
}

fn current_schema_version(conn: &Connection) -> Result<i64> {
    let version = conn
        .query_row("SELECT COALESCE(MAX(version), 0) FROM schema_migrations", [], |row| {
            row.get::<_, i64>(0)
        })
        .context("failed to read current schema version")?;
    Ok(version)
}

fn record_schema_version(conn: &Connection, version: i64) -> Result<()> {
    let now = now_rfc3339()?;
    conn.execute(
        "INSERT OR IGNORE INTO schema_migrations(version, applied_at) VALUES (?1, ?2)",
        params![version, now],
    )
    .with_context(|| format!("failed to record migration version {version}"))?;
    Ok(())
}

fn to_count(value: i64) -> Result<u64> {
    u64::try_from(value).with_context(|| format!("negative count from sqlite: {value}"))
}

fn now_rfc3339() -> Result<String> {
    rfc3339(OffsetDateTime::now_utc())
}

fn rfc3339(value: OffsetDateTime) -> Result<String> {
    value
        .format(&time::format_description::well_known::Rfc3339)
        .context("failed to format RFC3339 timestamp")
}

fn parse_rfc3339(value: &str) -> Result<OffsetDateTime> {
    OffsetDateTime::parse(value, &time::format_description::well_known::Rfc3339)
        .with_context(|| format!("invalid RFC3339 timestamp: {value}"))
}
