use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use yard_inventory_core::{
    classify_sample, clamp_sample_size, group_by_vessel_key, new_run_id,
    AnalysisReport, CleanupReport, DryRunReport, ExecuteReport, GroupError, InventoryError,
    MigrationLog, MigrationPhase, MigrationRun, RollbackReport, RunOutcome, SampleCheck,
    SampleItem, Shipment, ShipmentId, Vessel, VesselCombination, VesselGroup, VesselId,
    VesselKey, VerifyReport, DEFAULT_VERIFY_SAMPLE_SIZE,
};
use yard_inventory_store_sqlite::{IntegrityReport, SchemaStatus, SqliteStore};

pub const API_CONTRACT_VERSION: &str = "yard.v1";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MigrateResult {
    pub dry_run: bool,
    pub current_version: i64,
    pub target_version: i64,
    pub would_apply_versions: Vec<i64>,
    pub after_version: Option<i64>,
    pub up_to_date: Option<bool>,
}

/// Legacy shipment as it arrives from upstream systems. Fields are stored
/// verbatim; normalization happens only when the migration reads them.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct AddShipmentRequest {
    #[serde(default)]
    pub vessel_name: Option<String>,
    #[serde(default)]
    pub job_number: Option<String>,
    #[serde(default)]
    pub pod: Option<String>,
    #[serde(default)]
    pub vessel_id: Option<VesselId>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct AddVesselRequest {
    pub vessel_name: String,
    #[serde(default)]
    pub job_number: Option<String>,
    #[serde(default)]
    pub pod: Option<String>,
    #[serde(with = "time::serde::rfc3339::option", default)]
    pub etd: Option<OffsetDateTime>,
    #[serde(default)]
    pub shipping_line: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ResolvedVessel {
    pub vessel: Vessel,
    pub created: bool,
}

#[derive(Debug, Clone)]
pub struct InventoryApi {
    db_path: PathBuf,
    verify_sample_size: u32,
}

impl InventoryApi {
    #[must_use]
    pub fn new(db_path: PathBuf) -> Self {
        Self { db_path, verify_sample_size: DEFAULT_VERIFY_SAMPLE_SIZE }
    }

    /// Override the default verify sample size, clamped to the supported range.
    #[must_use]
    pub fn with_verify_sample_size(mut self, sample_size: u32) -> Self {
        self.verify_sample_size = clamp_sample_size(Some(sample_size));
        self
    }

    #[must_use]
    pub fn verify_sample_size(&self) -> u32 {
        self.verify_sample_size
    }

    fn open_store(&self) -> Result<SqliteStore> {
        SqliteStore::open(&self.db_path)
    }

    fn open_migrated_store(&self) -> Result<SqliteStore> {
        let mut store = self.open_store()?;
        store.migrate()?;
        Ok(store)
    }

    /// Inspect schema status without mutating data.
    ///
    /// # Errors
    /// Returns an error when the `SQLite` database cannot be opened or queried.
    pub fn schema_status(&self) -> Result<SchemaStatus> {
        let store = self.open_store()?;
        store.schema_status()
    }

    /// Apply pending migrations, or return planned versions for dry-run mode.
    ///
    /// # Errors
    /// Returns an error when migration planning or execution fails.
    pub fn migrate(&self, dry_run: bool) -> Result<MigrateResult> {
        let mut store = self.open_store()?;
        let before = store.schema_status()?;
        if dry_run {
            return Ok(MigrateResult {
                dry_run: true,
                current_version: before.current_version,
                target_version: before.target_version,
                would_apply_versions: before.pending_versions,
                after_version: None,
                up_to_date: None,
            });
        }

        store.migrate()?;
        let after = store.schema_status()?;
        Ok(MigrateResult {
            dry_run: false,
            current_version: before.current_version,
            target_version: before.target_version,
            would_apply_versions: before.pending_versions,
            after_version: Some(after.current_version),
            up_to_date: Some(after.pending_versions.is_empty()),
        })
    }

    /// Persist one legacy shipment.
    ///
    /// # Errors
    /// Returns an error when persistence fails.
    pub fn add_shipment(&self, input: AddShipmentRequest) -> Result<Shipment> {
        let store = self.open_migrated_store()?;
        let now = OffsetDateTime::now_utc();
        let shipment = Shipment {
            shipment_id: ShipmentId::new(),
            vessel_name: input.vessel_name,
            job_number: input.job_number,
            pod: input.pod,
            vessel_id: input.vessel_id,
            created_at: now,
            updated_at: now,
        };
        store.insert_shipment(&shipment)?;
        Ok(shipment)
    }

    /// Administrative vessel creation outside the migration. Fields are
    /// normalized and the identity must not already exist.
    ///
    /// # Errors
    /// Returns [`InventoryError::Validation`] for a blank or oversized field or a
    /// duplicate identity, or an error when persistence fails.
    pub fn add_vessel(&self, input: AddVesselRequest) -> Result<Vessel> {
        let store = self.open_migrated_store()?;
        let Some(key) = VesselKey::from_legacy(
            Some(&input.vessel_name),
            input.job_number.as_deref(),
            input.pod.as_deref(),
        ) else {
            return Err(InventoryError::Validation("vesselName MUST be non-empty".to_string()).into());
        };

        let mut vessel = Vessel::from_key(&key, OffsetDateTime::now_utc());
        vessel.etd = input.etd;
        vessel.shipping_line = input
            .shipping_line
            .map(|line| line.trim().to_string())
            .filter(|line| !line.is_empty());

        if !store.insert_vessel_if_absent(&vessel)? {
            return Err(InventoryError::Validation(format!(
                "vessel {}/{} already exists",
                key.vessel_name,
                key.job_number.as_deref().unwrap_or("-")
            ))
            .into());
        }
        Ok(vessel)
    }

    /// # Errors
    /// Returns an error when the store cannot be read.
    pub fn list_shipments(&self) -> Result<Vec<Shipment>> {
        self.open_migrated_store()?.list_shipments()
    }

    /// # Errors
    /// Returns [`InventoryError::NotFound`] for an unknown id, or an error when the store cannot be read.
    pub fn get_shipment(&self, shipment_id: ShipmentId) -> Result<Shipment> {
        self.open_migrated_store()?
            .get_shipment(shipment_id)?
            .ok_or_else(|| InventoryError::NotFound(format!("shipment {shipment_id}")).into())
    }

    /// # Errors
    /// Returns an error when the store cannot be read.
    pub fn list_vessels(&self) -> Result<Vec<Vessel>> {
        self.open_migrated_store()?.list_vessels()
    }

    /// Find or create the canonical vessel for raw legacy attributes.
    ///
    /// # Errors
    /// Returns [`InventoryError::Validation`] when the name is blank or a field
    /// is too long, or an error when the store fails.
    pub fn resolve_vessel(
        &self,
        vessel_name: &str,
        job_number: Option<&str>,
        pod: Option<&str>,
    ) -> Result<ResolvedVessel> {
        let Some(key) = VesselKey::from_legacy(Some(vessel_name), job_number, pod) else {
            return Err(InventoryError::Validation("vesselName MUST be non-empty".to_string()).into());
        };
        let store = self.open_migrated_store()?;
        let (vessel, created) = resolve_in_store(&store, &key)?;
        Ok(ResolvedVessel { vessel, created })
    }

    /// Read-only scan of migration state.
    ///
    /// # Errors
    /// Returns an error when the store cannot be read.
    pub fn analyze(&self) -> Result<AnalysisReport> {
        let store = self.open_migrated_store()?;
        let unmigrated = store.list_unmigrated_shipments()?;
        let counts = store.shipment_state_counts_with(unmigrated.len() as u64)?;
        let groups = group_by_vessel_key(&unmigrated);
        let report = AnalysisReport {
            unmigrated_shipments: counts.unmigrated,
            migrated_shipments: counts.migrated,
            vessel_free_shipments: counts.vessel_free,
            existing_vessels: store.count_vessels()?,
            distinct_combinations: groups.len() as u64,
            combinations: groups.iter().map(VesselCombination::from).collect(),
        };

        tracing::info!(
            "migration analyze: {} unmigrated, {} migrated, {} combinations",
            report.unmigrated_shipments,
            report.migrated_shipments,
            report.distinct_combinations
        );
        Ok(report)
    }

    /// Run the migration for real, or simulate it without writes when `dry_run` is set.
    ///
    /// A failing group is recorded in the log's `errors` and the remaining
    /// groups still run.
    ///
    /// The audit row is best effort: if it cannot be written the failure is
    /// logged and the migration log is still returned.
    ///
    /// # Errors
    /// Returns an error only when the store cannot be opened or read up front.
    pub fn execute(&self, dry_run: bool) -> Result<ExecuteReport> {
        if dry_run {
            return self.execute_dry_run().map(ExecuteReport::DryRun);
        }

        let mut store = self.open_migrated_store()?;
        let started_at = OffsetDateTime::now_utc();
        let groups = group_by_vessel_key(&store.list_unmigrated_shipments()?);
        let mut log = MigrationLog::new(new_run_id());

        tracing::info!("migration execute {}: {} groups", log.run_id, groups.len());

        for group in &groups {
            match migrate_group(&mut store, group) {
                Ok((vessel_id, created, updated)) => {
                    log.record_success(&group.key, vessel_id, created, updated);
                }
                Err(err) => {
                    tracing::warn!("migration execute {}: group {} failed: {:#}", log.run_id, group.key, err);
                    log.record_failure(&group.key, format!("{err:#}"));
                }
            }
        }

        let outcome = if log.is_partial_failure() {
            RunOutcome::CompletedWithErrors
        } else {
            RunOutcome::Completed
        };
        record_run_or_log(&store, &MigrationRun {
            run_id: log.run_id.clone(),
            phase: MigrationPhase::Execute,
            dry_run: false,
            started_at,
            finished_at: OffsetDateTime::now_utc(),
            outcome,
            vessels_created: log.vessels_created,
            shipments_updated: log.shipments_updated,
            error_count: log.errors.len() as u64,
            detail: serde_json::json!({
                "groups": groups.len(),
                "errors": log.errors,
            }),
        });

        tracing::info!(
            "migration execute {} finished: {} vessels created, {} shipments updated, {} errors",
            log.run_id,
            log.vessels_created,
            log.shipments_updated,
            log.errors.len()
        );
        Ok(ExecuteReport::Applied(log))
    }

    fn execute_dry_run(&self) -> Result<DryRunReport> {
        let store = self.open_migrated_store()?;
        let groups = group_by_vessel_key(&store.list_unmigrated_shipments()?);

        // Groups sharing a (name, job) identity resolve to one vessel.
        let mut planned: BTreeMap<(String, Option<String>), VesselCombination> = BTreeMap::new();
        let mut reused: BTreeSet<(String, Option<String>)> = BTreeSet::new();
        let mut invalid_combinations = Vec::new();
        let mut shipments_to_update = 0_u64;

        for group in &groups {
            if let Err(err) = group.key.validate() {
                invalid_combinations.push(GroupError {
                    vessel_name: group.key.vessel_name.clone(),
                    job_number: group.key.job_number.clone(),
                    pod: group.key.pod.clone(),
                    error: err.to_string(),
                });
                continue;
            }

            let identity = (group.key.vessel_name.clone(), group.key.job_number.clone());
            let (vessel_name, job_number) = group.key.identity();
            let existing = match store.find_vessel_by_identity(vessel_name, job_number) {
                Ok(existing) => existing,
                Err(err) => {
                    tracing::warn!("migration dry run: lookup for group {} failed: {:#}", group.key, err);
                    invalid_combinations.push(GroupError {
                        vessel_name: group.key.vessel_name.clone(),
                        job_number: group.key.job_number.clone(),
                        pod: group.key.pod.clone(),
                        error: format!("{err:#}"),
                    });
                    continue;
                }
            };

            shipments_to_update += group.shipment_ids.len() as u64;
            if existing.is_some() {
                reused.insert(identity);
                continue;
            }
            planned
                .entry(identity)
                .and_modify(|combination| {
                    combination.shipment_count += group.shipment_ids.len() as u64;
                })
                .or_insert_with(|| VesselCombination::from(group));
        }

        let report = DryRunReport {
            dry_run: true,
            distinct_combinations: groups.len() as u64,
            shipments_to_update,
            vessels_to_create: planned.into_values().collect(),
            vessels_to_reuse: reused.len() as u64,
            invalid_combinations,
            combinations: groups.iter().map(VesselCombination::from).collect(),
        };

        tracing::info!(
            "migration dry run: would create {} vessels and update {} shipments",
            report.vessels_to_create.len(),
            report.shipments_to_update
        );
        Ok(report)
    }

    /// Check completeness, referential integrity and a random sample of links.
    /// `sample_size` overrides the configured default for this call.
    ///
    /// # Errors
    /// Returns an error when the store cannot be read.
    pub fn verify(&self, sample_size: Option<u32>) -> Result<VerifyReport> {
        let requested = sample_size.map_or(self.verify_sample_size, |size| clamp_sample_size(Some(size)));
        let store = self.open_migrated_store()?;
        let counts = store.shipment_state_counts()?;
        let referenced = store.count_referenced_vessel_ids()?;
        let orphaned = store.orphaned_vessel_ids()?;

        let items = store
            .sample_migrated(requested)?
            .into_iter()
            .map(|link| SampleItem {
                outcome: classify_sample(
                    link.shipment_vessel_name.as_deref(),
                    link.linked_vessel_name.as_deref(),
                ),
                shipment_id: link.shipment_id,
                vessel_id: link.vessel_id,
                shipment_vessel_name: link.shipment_vessel_name,
                linked_vessel_name: link.linked_vessel_name,
            })
            .collect();
        let sample = SampleCheck::from_items(requested, counts.migrated, items);
        let report = VerifyReport::assemble(counts.unmigrated, counts.migrated, referenced, orphaned, sample);

        tracing::info!(
            "migration verify: {} ({} unmigrated, {} orphans, {} sample mismatches)",
            report.status.as_str(),
            report.unmigrated_shipments,
            report.orphan_count,
            report.sample.mismatches
        );
        Ok(report)
    }

    /// Drop every shipment's vessel reference. Vessels are kept. Without
    /// `confirm` this only reports what would change.
    ///
    /// # Errors
    /// Returns an error when the store cannot be read or updated.
    pub fn rollback(&self, confirm: bool) -> Result<RollbackReport> {
        let store = self.open_migrated_store()?;
        let shipments_affected = store.shipment_state_counts()?.migrated;
        let vessels_preserved = store.count_vessels()?;

        if !confirm {
            return Ok(RollbackReport {
                confirmed: false,
                shipments_affected,
                shipments_reverted: 0,
                vessels_preserved,
                run_id: None,
            });
        }

        let started_at = OffsetDateTime::now_utc();
        let run_id = new_run_id();
        let shipments_reverted = store.clear_vessel_refs()?;
        record_run_or_log(&store, &MigrationRun {
            run_id: run_id.clone(),
            phase: MigrationPhase::Rollback,
            dry_run: false,
            started_at,
            finished_at: OffsetDateTime::now_utc(),
            outcome: RunOutcome::Completed,
            vessels_created: 0,
            shipments_updated: shipments_reverted,
            error_count: 0,
            detail: serde_json::json!({ "vesselsPreserved": vessels_preserved }),
        });

        tracing::info!("migration rollback {run_id}: {shipments_reverted} shipments reverted");
        Ok(RollbackReport {
            confirmed: true,
            shipments_affected,
            shipments_reverted,
            vessels_preserved,
            run_id: Some(run_id),
        })
    }

    /// Strip legacy vessel fields from every shipment. Irreversible. Without
    /// `confirm` this only reports what is left to strip.
    ///
    /// # Errors
    /// Returns [`InventoryError::PreconditionFailed`] when `verify_first` is set
    /// and unmigrated shipments remain, or an error when the store fails.
    pub fn cleanup(&self, confirm: bool, verify_first: bool) -> Result<CleanupReport> {
        let store = self.open_migrated_store()?;
        let unmigrated_shipments = store.shipment_state_counts()?.unmigrated;
        let legacy_fields = store.legacy_field_counts()?;
        let would_refuse = verify_first && unmigrated_shipments > 0;

        let mut report = CleanupReport {
            confirmed: confirm,
            verify_first,
            unmigrated_shipments,
            legacy_fields,
            would_refuse,
            shipments_cleaned: 0,
            run_id: None,
        };
        if !confirm {
            return Ok(report);
        }

        let started_at = OffsetDateTime::now_utc();
        let run_id = new_run_id();

        if would_refuse {
            record_run_or_log(&store, &MigrationRun {
                run_id: run_id.clone(),
                phase: MigrationPhase::Cleanup,
                dry_run: false,
                started_at,
                finished_at: OffsetDateTime::now_utc(),
                outcome: RunOutcome::Refused,
                vessels_created: 0,
                shipments_updated: 0,
                error_count: 1,
                detail: serde_json::json!({ "unmigratedShipments": unmigrated_shipments }),
            });
            tracing::warn!(
                "migration cleanup {run_id} refused: {unmigrated_shipments} shipments still unmigrated"
            );
            return Err(InventoryError::PreconditionFailed(format!(
                "{unmigrated_shipments} shipments are still unmigrated; run execute first or disable verifyFirst"
            ))
            .into());
        }

        let shipments_cleaned = store.strip_legacy_fields()?;
        record_run_or_log(&store, &MigrationRun {
            run_id: run_id.clone(),
            phase: MigrationPhase::Cleanup,
            dry_run: false,
            started_at,
            finished_at: OffsetDateTime::now_utc(),
            outcome: RunOutcome::Completed,
            vessels_created: 0,
            shipments_updated: shipments_cleaned,
            error_count: 0,
            detail: serde_json::to_value(&report.legacy_fields)
                .context("failed to serialize legacy field counts")?,
        });

        tracing::info!("migration cleanup {run_id}: {shipments_cleaned} shipments cleaned");
        report.shipments_cleaned = shipments_cleaned;
        report.run_id = Some(run_id);
        Ok(report)
    }

    /// # Errors
    /// Returns an error when the audit log cannot be read.
    pub fn list_runs(&self) -> Result<Vec<MigrationRun>> {
        self.open_migrated_store()?.list_runs()
    }

    /// # Errors
    /// Returns an error when the backup cannot be written.
    pub fn backup(&self, out_file: &Path) -> Result<()> {
        self.open_migrated_store()?.backup_database(out_file)
    }

    /// # Errors
    /// Returns an error when the backup is missing or cannot be restored.
    pub fn restore(&self, in_file: &Path) -> Result<()> {
        let mut store = self.open_store()?;
        store.restore_database(in_file)
    }

    /// # Errors
    /// Returns an error when an integrity probe fails to run.
    pub fn integrity_check(&self) -> Result<IntegrityReport> {
        self.open_store()?.integrity_check()
    }
}

/// Find → insert-if-absent → re-fetch. Concurrent callers converge on the
/// row that won the unique index; only the winner reports `created`.
fn resolve_in_store(store: &SqliteStore, key: &VesselKey) -> Result<(Vessel, bool)> {
    key.validate()?;
    let (vessel_name, job_number) = key.identity();
    if let Some(existing) = store.find_vessel_by_identity(vessel_name, job_number)? {
        return Ok((existing, false));
    }

    let candidate = Vessel::from_key(key, OffsetDateTime::now_utc());
    if store.insert_vessel_if_absent(&candidate)? {
        return Ok((candidate, true));
    }

    store
        .find_vessel_by_identity(vessel_name, job_number)?
        .map(|existing| (existing, false))
        .ok_or_else(|| anyhow!("vessel {key} conflicted on insert but could not be re-fetched"))
}

/// Audit rows are written after the work commits. A failed write is logged
/// instead of returned.
fn record_run_or_log(store: &SqliteStore, run: &MigrationRun) {
    if let Err(err) = store.record_run(run) {
        tracing::error!(
            "failed to record {} run {}: {:#}",
            run.phase.as_str(),
            run.run_id,
            err
        );
    }
}

fn migrate_group(store: &mut SqliteStore, group: &VesselGroup) -> Result<(VesselId, bool, u64)> {
    let (vessel, created) = resolve_in_store(store, &group.key)?;
    let updated = store
        .assign_vessel(vessel.vessel_id, &group.shipment_ids)
        .with_context(|| format!("failed to link shipments to vessel {}", vessel.vessel_id))?;
    Ok((vessel.vessel_id, created, updated))
}

#[cfg(test)]
mod tests {
    use std::thread;

    use super::*;
    use yard_inventory_core::{SampleOutcome, ShipmentState, VerifyStatus, MAX_FIELD_LEN};

    fn unique_temp_db_path() -> PathBuf {
        std::env::temp_dir().join(format!("yard-inventory-api-{}.sqlite3", ulid::Ulid::new()))
    }

    fn cleanup_db(db_path: &Path) {
        for suffix in ["", "-wal", "-shm"] {
            let _ = std::fs::remove_file(format!("{}{}", db_path.display(), suffix));
        }
    }

    fn shipment(
        vessel_name: Option<&str>,
        job_number: Option<&str>,
        pod: Option<&str>,
    ) -> AddShipmentRequest {
        AddShipmentRequest {
            vessel_name: vessel_name.map(str::to_string),
            job_number: job_number.map(str::to_string),
            pod: pod.map(str::to_string),
            vessel_id: None,
        }
    }

    fn applied(report: ExecuteReport) -> Result<MigrationLog> {
        match report {
            ExecuteReport::Applied(log) => Ok(log),
            ExecuteReport::DryRun(_) => Err(anyhow!("expected an applied execute report")),
        }
    }

    fn dry(report: ExecuteReport) -> Result<DryRunReport> {
        match report {
            ExecuteReport::DryRun(report) => Ok(report),
            ExecuteReport::Applied(_) => Err(anyhow!("expected a dry-run execute report")),
        }
    }

    fn typed_error(err: &anyhow::Error) -> Option<&InventoryError> {
        err.downcast_ref::<InventoryError>()
    }

    // Test IDs: TAPI-001
    #[test]
    fn reference_scenario_creates_two_vessels_for_three_shipments() -> Result<()> {
        let db_path = unique_temp_db_path();
        let api = InventoryApi::new(db_path.clone());

        let s1 = api.add_shipment(shipment(Some("EVER GIVEN"), Some("J1"), None))?;
        let s2 = api.add_shipment(shipment(Some("EVER GIVEN"), Some("J1"), None))?;
        let s3 = api.add_shipment(shipment(Some("EVER GIVEN"), None, None))?;

        let analysis = api.analyze()?;
        assert_eq!(analysis.distinct_combinations, 2);
        assert_eq!(analysis.unmigrated_shipments, 3);
        assert_eq!(analysis.existing_vessels, 0);

        let log = applied(api.execute(false)?)?;
        assert_eq!(log.vessels_created, 2);
        assert_eq!(log.shipments_updated, 3);
        assert!(log.errors.is_empty());
        assert_eq!(log.vessel_map.len(), 2);

        let v1 = api.get_shipment(s1.shipment_id)?.vessel_id;
        let v2 = api.get_shipment(s2.shipment_id)?.vessel_id;
        let v3 = api.get_shipment(s3.shipment_id)?.vessel_id;
        assert!(v1.is_some());
        assert_eq!(v1, v2);
        assert_ne!(v1, v3);
        assert!(v3.is_some());

        cleanup_db(&db_path);
        Ok(())
    }

    // Test IDs: TAPI-002
    #[test]
    fn execute_is_idempotent() -> Result<()> {
        let db_path = unique_temp_db_path();
        let api = InventoryApi::new(db_path.clone());
        api.add_shipment(shipment(Some("MSC OSCAR"), Some("J2"), Some("JEA")))?;
        api.add_shipment(shipment(Some("MAERSK ESSEN"), None, None))?;

        let first = applied(api.execute(false)?)?;
        assert_eq!(first.shipments_updated, 2);
        let second = applied(api.execute(false)?)?;
        assert_eq!(second.shipments_updated, 0);
        assert_eq!(second.vessels_created, 0);
        assert!(second.vessel_map.is_empty());
        assert_eq!(api.list_vessels()?.len(), 2);

        cleanup_db(&db_path);
        Ok(())
    }

    // Test IDs: TAPI-003
    #[test]
    fn null_empty_and_blank_job_numbers_share_one_vessel() -> Result<()> {
        let db_path = unique_temp_db_path();
        let api = InventoryApi::new(db_path.clone());
        api.add_shipment(shipment(Some("ever given"), None, Some("JEA")))?;
        api.add_shipment(shipment(Some("EVER GIVEN "), Some(""), Some("jea")))?;
        api.add_shipment(shipment(Some(" Ever Given"), Some("  "), Some("JEA ")))?;

        let log = applied(api.execute(false)?)?;
        assert_eq!(log.vessels_created, 1);
        assert_eq!(log.shipments_updated, 3);

        let vessels = api.list_vessels()?;
        assert_eq!(vessels.len(), 1);
        assert_eq!(vessels[0].vessel_name, "EVER GIVEN");
        assert_eq!(vessels[0].job_number, None);
        let linked = api
            .list_shipments()?
            .iter()
            .filter(|shipment| shipment.vessel_id == Some(vessels[0].vessel_id))
            .count();
        assert_eq!(linked, 3);

        cleanup_db(&db_path);
        Ok(())
    }

    // Test IDs: TAPI-004
    #[test]
    fn groups_with_different_pods_reuse_one_identity() -> Result<()> {
        let db_path = unique_temp_db_path();
        let api = InventoryApi::new(db_path.clone());
        api.add_shipment(shipment(Some("EVER GIVEN"), Some("J1"), Some("JEA")))?;
        api.add_shipment(shipment(Some("EVER GIVEN"), Some("J1"), Some("DXB")))?;

        let plan = dry(api.execute(true)?)?;
        assert_eq!(plan.distinct_combinations, 2);
        assert_eq!(plan.vessels_to_create.len(), 1);
        assert_eq!(plan.vessels_to_create[0].shipment_count, 2);

        let log = applied(api.execute(false)?)?;
        assert_eq!(log.vessels_created, 1);
        assert_eq!(log.vessel_map.len(), 2);
        assert_eq!(log.vessel_map[0].vessel_id, log.vessel_map[1].vessel_id);
        assert_eq!(log.shipments_updated, 2);

        cleanup_db(&db_path);
        Ok(())
    }

    // Test IDs: TAPI-005
    #[test]
    fn dry_run_writes_nothing_and_predicts_execute() -> Result<()> {
        let db_path = unique_temp_db_path();
        let api = InventoryApi::new(db_path.clone());
        api.add_vessel(AddVesselRequest {
            vessel_name: "maersk essen".to_string(),
            job_number: None,
            pod: None,
            etd: None,
            shipping_line: Some("Maersk".to_string()),
        })?;
        api.add_shipment(shipment(Some("MAERSK ESSEN"), None, None))?;
        api.add_shipment(shipment(Some("EVER GIVEN"), Some("J1"), None))?;
        api.add_shipment(shipment(None, Some("J9"), None))?;

        let before = api.list_shipments()?;
        let plan = dry(api.execute(true)?)?;
        assert!(plan.dry_run);
        assert_eq!(plan.shipments_to_update, 2);
        assert_eq!(plan.vessels_to_create.len(), 1);
        assert_eq!(plan.vessels_to_reuse, 1);
        assert_eq!(api.list_shipments()?, before);
        assert_eq!(api.list_vessels()?.len(), 1);
        assert!(api.list_runs()?.is_empty());

        let log = applied(api.execute(false)?)?;
        assert_eq!(log.vessels_created, plan.vessels_to_create.len() as u64);
        assert_eq!(log.shipments_updated, plan.shipments_to_update);

        cleanup_db(&db_path);
        Ok(())
    }

    // Test IDs: TAPI-006
    #[test]
    fn failing_group_is_isolated_from_the_rest() -> Result<()> {
        let db_path = unique_temp_db_path();
        let api = InventoryApi::new(db_path.clone());
        let oversized = "X".repeat(MAX_FIELD_LEN + 1);
        let bad = api.add_shipment(shipment(Some(&oversized), None, None))?;
        api.add_shipment(shipment(Some("EVER GIVEN"), None, None))?;

        let plan = dry(api.execute(true)?)?;
        assert_eq!(plan.invalid_combinations.len(), 1);
        assert_eq!(plan.shipments_to_update, 1);

        let log = applied(api.execute(false)?)?;
        assert!(log.is_partial_failure());
        assert_eq!(log.errors.len(), 1);
        assert_eq!(log.errors[0].vessel_name, oversized);
        assert_eq!(log.vessels_created, 1);
        assert_eq!(log.shipments_updated, 1);
        assert_eq!(api.get_shipment(bad.shipment_id)?.state(), ShipmentState::Unmigrated);

        let runs = api.list_runs()?;
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].outcome, RunOutcome::CompletedWithErrors);
        assert_eq!(runs[0].error_count, 1);

        cleanup_db(&db_path);
        Ok(())
    }

    // Test IDs: TAPI-007
    #[test]
    fn verify_passes_after_full_migration_and_detects_orphans() -> Result<()> {
        let db_path = unique_temp_db_path();
        let api = InventoryApi::new(db_path.clone()).with_verify_sample_size(5);
        api.add_shipment(shipment(Some("EVER GIVEN"), Some("J1"), None))?;
        api.add_shipment(shipment(Some("MSC OSCAR"), None, None))?;
        api.add_shipment(shipment(None, None, None))?;

        let before = api.verify(None)?;
        assert_eq!(before.status, VerifyStatus::IssuesFound);
        assert_eq!(before.unmigrated_shipments, 2);

        api.execute(false)?;
        let after = api.verify(None)?;
        assert_eq!(after.status, VerifyStatus::Passed);
        assert_eq!(after.referenced_vessel_ids, 2);
        assert_eq!(after.sample.size, 2);
        assert_eq!(after.sample.requested_size, 5);
        assert!(after.sample.sampling_is_exhaustive);
        assert!(after.sample.items.iter().all(|item| item.outcome == SampleOutcome::Match));

        let ghost = VesselId::new();
        api.add_shipment(AddShipmentRequest {
            vessel_id: Some(ghost),
            ..shipment(Some("GHOST"), None, None)
        })?;
        let orphaned = api.verify(Some(1000))?;
        assert_eq!(orphaned.status, VerifyStatus::IssuesFound);
        assert!(orphaned.orphan_count >= 1);
        assert_eq!(orphaned.orphaned_vessel_ids, vec![ghost]);

        let narrow = api.verify(Some(1))?;
        assert_eq!(narrow.sample.size, 1);
        assert!(!narrow.sample.sampling_is_exhaustive);

        cleanup_db(&db_path);
        Ok(())
    }

    // Test IDs: TAPI-008
    #[test]
    fn rollback_reverts_references_and_keeps_vessels() -> Result<()> {
        let db_path = unique_temp_db_path();
        let api = InventoryApi::new(db_path.clone());
        api.add_shipment(shipment(Some("EVER GIVEN"), Some("J1"), None))?;
        api.add_shipment(shipment(Some("EVER GIVEN"), None, None))?;
        api.add_shipment(shipment(None, None, Some("JEA")))?;
        api.execute(false)?;
        let vessels_before = api.list_vessels()?.len();

        let preview = api.rollback(false)?;
        assert!(!preview.confirmed);
        assert_eq!(preview.shipments_affected, 2);
        assert_eq!(preview.shipments_reverted, 0);
        assert_eq!(api.analyze()?.migrated_shipments, 2);

        let done = api.rollback(true)?;
        assert_eq!(done.shipments_reverted, 2);
        assert!(done.run_id.is_some());
        assert_eq!(api.list_vessels()?.len(), vessels_before);

        let analysis = api.analyze()?;
        assert_eq!(analysis.unmigrated_shipments, 2);
        assert_eq!(analysis.migrated_shipments, 0);
        assert_eq!(analysis.vessel_free_shipments, 1);

        let rerun = applied(api.execute(false)?)?;
        assert_eq!(rerun.vessels_created, 0);
        assert_eq!(rerun.shipments_updated, 2);

        cleanup_db(&db_path);
        Ok(())
    }

    // Test IDs: TAPI-009
    #[test]
    fn cleanup_refuses_while_shipments_are_unmigrated() -> Result<()> {
        let db_path = unique_temp_db_path();
        let api = InventoryApi::new(db_path.clone());
        api.add_shipment(shipment(Some("EVER GIVEN"), Some("J1"), Some("JEA")))?;
        let before = api.list_shipments()?;

        let preview = api.cleanup(false, true)?;
        assert!(preview.would_refuse);
        assert_eq!(preview.legacy_fields.with_vessel_name, 1);
        assert_eq!(preview.shipments_cleaned, 0);

        let err = match api.cleanup(true, true) {
            Ok(report) => panic!("cleanup should have been refused: {report:?}"),
            Err(err) => err,
        };
        assert!(matches!(typed_error(&err), Some(InventoryError::PreconditionFailed(_))));
        assert_eq!(api.list_shipments()?, before);

        let runs = api.list_runs()?;
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].phase, MigrationPhase::Cleanup);
        assert_eq!(runs[0].outcome, RunOutcome::Refused);

        cleanup_db(&db_path);
        Ok(())
    }

    // Test IDs: TAPI-010
    #[test]
    fn cleanup_strips_every_shipment_once_migrated() -> Result<()> {
        let db_path = unique_temp_db_path();
        let api = InventoryApi::new(db_path.clone());
        api.add_shipment(shipment(Some("EVER GIVEN"), Some("J1"), Some("JEA")))?;
        api.add_shipment(shipment(Some(""), Some("J9"), Some("DXB")))?;
        api.execute(false)?;

        let report = api.cleanup(true, true)?;
        assert!(report.confirmed);
        assert_eq!(report.shipments_cleaned, 2);
        for shipment in api.list_shipments()? {
            assert_eq!(shipment.vessel_name, None);
            assert_eq!(shipment.job_number, None);
            assert_eq!(shipment.pod, None);
        }

        let verify = api.verify(None)?;
        assert_eq!(verify.status, VerifyStatus::Passed);
        assert!(verify
            .sample
            .items
            .iter()
            .all(|item| item.outcome == SampleOutcome::LegacyCleared));

        cleanup_db(&db_path);
        Ok(())
    }

    // Test IDs: TAPI-011
    #[test]
    fn cleanup_without_verify_first_strips_unmigrated_shipments() -> Result<()> {
        let db_path = unique_temp_db_path();
        let api = InventoryApi::new(db_path.clone());
        api.add_shipment(shipment(Some("EVER GIVEN"), None, None))?;

        let report = api.cleanup(true, false)?;
        assert!(!report.would_refuse);
        assert_eq!(report.unmigrated_shipments, 1);
        assert_eq!(report.shipments_cleaned, 1);
        assert_eq!(api.analyze()?.vessel_free_shipments, 1);

        cleanup_db(&db_path);
        Ok(())
    }

    // Test IDs: TAPI-012
    #[test]
    fn resolver_and_admin_creation_share_identity_rules() -> Result<()> {
        let db_path = unique_temp_db_path();
        let api = InventoryApi::new(db_path.clone());

        let first = api.resolve_vessel(" ever given ", Some(""), Some("jea"))?;
        assert!(first.created);
        assert_eq!(first.vessel.pod.as_deref(), Some("JEA"));
        let second = api.resolve_vessel("EVER GIVEN", None, None)?;
        assert!(!second.created);
        assert_eq!(first.vessel.vessel_id, second.vessel.vessel_id);

        let duplicate = api.add_vessel(AddVesselRequest {
            vessel_name: "Ever Given".to_string(),
            job_number: Some("   ".to_string()),
            pod: None,
            etd: None,
            shipping_line: None,
        });
        let err = match duplicate {
            Ok(vessel) => panic!("duplicate vessel should be rejected: {vessel:?}"),
            Err(err) => err,
        };
        assert!(matches!(typed_error(&err), Some(InventoryError::Validation(_))));

        let blank = api.resolve_vessel("   ", None, None);
        assert!(blank
            .as_ref()
            .err()
            .and_then(typed_error)
            .is_some_and(|err| matches!(err, InventoryError::Validation(_))));

        let missing = api.get_shipment(ShipmentId::new());
        assert!(missing
            .as_ref()
            .err()
            .and_then(typed_error)
            .is_some_and(|err| matches!(err, InventoryError::NotFound(_))));

        cleanup_db(&db_path);
        Ok(())
    }

    // Test IDs: TAPI-013
    #[test]
    fn migrate_dry_run_reports_pending_versions() -> Result<()> {
        let db_path = unique_temp_db_path();
        let api = InventoryApi::new(db_path.clone());

        let planned = api.migrate(true)?;
        assert_eq!(planned.would_apply_versions, vec![1, 2]);
        assert_eq!(planned.after_version, None);

        let applied = api.migrate(false)?;
        assert_eq!(applied.after_version, Some(applied.target_version));
        assert_eq!(applied.up_to_date, Some(true));

        cleanup_db(&db_path);
        Ok(())
    }

    // Test IDs: TCONC-002
    #[test]
    fn concurrent_executes_do_not_duplicate_vessels_or_double_count() -> Result<()> {
        let db_path = unique_temp_db_path();
        let api = InventoryApi::new(db_path.clone());
        api.migrate(false)?;
        for index in 0..40 {
            let name = if index % 2 == 0 { "EVER GIVEN" } else { "msc oscar" };
            let job = if index % 3 == 0 { None } else { Some("J1") };
            api.add_shipment(shipment(Some(name), job, None))?;
        }

        let mut handles = Vec::new();
        for _ in 0..3 {
            let api = api.clone();
            handles.push(thread::spawn(move || -> Result<MigrationLog> { applied(api.execute(false)?) }));
        }

        let mut total_updated = 0;
        let mut total_created = 0;
        for handle in handles {
            let Ok(result) = handle.join() else {
                return Err(anyhow!("execute thread panicked"));
            };
            let log = result?;
            assert!(log.errors.is_empty(), "unexpected group errors: {:?}", log.errors);
            total_updated += log.shipments_updated;
            total_created += log.vessels_created;
        }

        assert_eq!(total_updated, 40);
        assert_eq!(total_created, 4);
        assert_eq!(api.list_vessels()?.len(), 4);
        assert_eq!(api.analyze()?.unmigrated_shipments, 0);

        cleanup_db(&db_path);
        Ok(())
    }

    // Test IDs: TCONC-003
    #[test]
    fn concurrent_first_use_of_fresh_database_succeeds() -> Result<()> {
        for _ in 0..5 {
            let db_path = unique_temp_db_path();

            let mut handles = Vec::new();
            for _ in 0..8 {
                let api = InventoryApi::new(db_path.clone());
                handles.push(thread::spawn(move || -> Result<AnalysisReport> { api.analyze() }));
            }

            for handle in handles {
                let Ok(result) = handle.join() else {
                    return Err(anyhow!("analyze thread panicked"));
                };
                let report = result?;
                assert_eq!(report.unmigrated_shipments, 0);
                assert_eq!(report.distinct_combinations, 0);
            }

            let status = InventoryApi::new(db_path.clone()).schema_status()?;
            assert!(status.pending_versions.is_empty());
            cleanup_db(&db_path);
        }
        Ok(())
    }

    // Test IDs: TAPI-014
    #[test]
    fn audit_write_failure_still_returns_migration_log() -> Result<()> {
        let db_path = unique_temp_db_path();
        let api = InventoryApi::new(db_path.clone());
        api.add_shipment(shipment(Some("EVER GIVEN"), Some("J1"), None))?;
        api.add_shipment(shipment(Some("MSC OSCAR"), None, None))?;

        let conn = rusqlite::Connection::open(&db_path)?;
        conn.execute_batch(
            "CREATE TRIGGER reject_runs BEFORE INSERT ON migration_runs
             BEGIN SELECT RAISE(ABORT, 'audit log offline'); END;",
        )?;
        drop(conn);

        let log = applied(api.execute(false)?)?;
        assert_eq!(log.vessels_created, 2);
        assert_eq!(log.shipments_updated, 2);
        assert!(log.errors.is_empty());
        assert_eq!(api.analyze()?.unmigrated_shipments, 0);

        let rollback = api.rollback(true)?;
        assert_eq!(rollback.shipments_reverted, 2);
        assert!(rollback.run_id.is_some());

        assert!(api.list_runs()?.is_empty());

        cleanup_db(&db_path);
        Ok(())
    }

    // Test IDs: TAPI-015
    #[test]
    fn dry_run_lookup_failure_is_reported_per_group() -> Result<()> {
        let db_path = unique_temp_db_path();
        let api = InventoryApi::new(db_path.clone());
        api.add_shipment(shipment(Some("EVER GIVEN"), Some("J1"), None))?;
        api.add_shipment(shipment(Some("EVER GIVEN"), Some("J1"), None))?;
        api.add_shipment(shipment(Some("MSC OSCAR"), None, Some("JEA")))?;

        let conn = rusqlite::Connection::open(&db_path)?;
        conn.execute_batch("DROP TABLE vessels;")?;
        drop(conn);

        let plan = dry(api.execute(true)?)?;
        assert_eq!(plan.distinct_combinations, 2);
        assert_eq!(plan.invalid_combinations.len(), 2);
        assert_eq!(plan.shipments_to_update, 0);
        assert!(plan.vessels_to_create.is_empty());
        assert!(plan
            .invalid_combinations
            .iter()
            .all(|failure| failure.error.contains("failed to look up vessel identity")));

        let log = applied(api.execute(false)?)?;
        assert_eq!(log.errors.len(), plan.invalid_combinations.len());
        assert_eq!(log.shipments_updated, plan.shipments_to_update);

        cleanup_db(&db_path);
        Ok(())
    }
}
