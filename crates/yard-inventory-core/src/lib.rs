use std::collections::BTreeMap;
use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use ulid::Ulid;

/// Upper bound on any normalized vessel attribute.
pub const MAX_FIELD_LEN: usize = 100;

/// Default number of migrated shipments drawn by the verify phase.
pub const DEFAULT_VERIFY_SAMPLE_SIZE: u32 = 10;

/// Hard ceiling for a caller-supplied verify sample size.
pub const MAX_VERIFY_SAMPLE_SIZE: u32 = 1000;

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum InventoryError {
    #[error("validation error: {0}")]
    Validation(String),
    #[error("precondition failed: {0}")]
    PreconditionFailed(String),
    #[error("not found: {0}")]
    NotFound(String),
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct ShipmentId(pub Ulid);

impl ShipmentId {
    #[must_use]
    pub fn new() -> Self {
        Self(Ulid::new())
    }

    /// Parse a stored or caller-supplied shipment identifier.
    ///
    /// # Errors
    /// Returns [`InventoryError::Validation`] when `raw` is not a ULID.
    pub fn parse(raw: &str) -> Result<Self, InventoryError> {
        Ulid::from_string(raw.trim())
            .map(Self)
            .map_err(|_| InventoryError::Validation(format!("invalid shipment id: {raw}")))
    }
}

impl Default for ShipmentId {
    fn default() -> Self {
        Self::new()
    }
}

impl Display for ShipmentId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct VesselId(pub Ulid);

impl VesselId {
    #[must_use]
    pub fn new() -> Self {
        Self(Ulid::new())
    }

    /// Parse a stored or caller-supplied vessel identifier.
    ///
    /// # Errors
    /// Returns [`InventoryError::Validation`] when `raw` is not a ULID.
    pub fn parse(raw: &str) -> Result<Self, InventoryError> {
        Ulid::from_string(raw.trim())
            .map(Self)
            .map_err(|_| InventoryError::Validation(format!("invalid vessel id: {raw}")))
    }
}

impl Default for VesselId {
    fn default() -> Self {
        Self::new()
    }
}

impl Display for VesselId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Trim and upper-case one vessel attribute. Blank input collapses to `None`,
/// so missing, null and empty-string values share one equivalence class.
#[must_use]
pub fn normalize_field(value: Option<&str>) -> Option<String> {
    let trimmed = value?.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_uppercase())
    }
}

/// Migration state of a single shipment.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ShipmentState {
    Unmigrated,
    Migrated,
    VesselFree,
}

impl ShipmentState {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Unmigrated => "unmigrated",
            Self::Migrated => "migrated",
            Self::VesselFree => "vessel_free",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "unmigrated" => Some(Self::Unmigrated),
            "migrated" => Some(Self::Migrated),
            "vessel_free" => Some(Self::VesselFree),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Shipment {
    pub shipment_id: ShipmentId,
    pub vessel_name: Option<String>,
    pub job_number: Option<String>,
    pub pod: Option<String>,
    pub vessel_id: Option<VesselId>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

impl Shipment {
    #[must_use]
    pub fn state(&self) -> ShipmentState {
        if self.vessel_id.is_some() {
            ShipmentState::Migrated
        } else if normalize_field(self.vessel_name.as_deref()).is_some() {
            ShipmentState::Unmigrated
        } else {
            ShipmentState::VesselFree
        }
    }

    /// Normalized legacy vessel tuple, or `None` for a vessel-free shipment.
    #[must_use]
    pub fn vessel_key(&self) -> Option<VesselKey> {
        VesselKey::from_legacy(
            self.vessel_name.as_deref(),
            self.job_number.as_deref(),
            self.pod.as_deref(),
        )
    }
}

/// Normalized `(vesselName, jobNumber, pod)` tuple used to group shipments.
///
/// Vessel identity (the uniqueness rule) only covers `vessel_name` and
/// `job_number`; `pod` splits groups but not vessels.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "camelCase")]
pub struct VesselKey {
    pub vessel_name: String,
    pub job_number: Option<String>,
    pub pod: Option<String>,
}

impl VesselKey {
    #[must_use]
    pub fn from_legacy(
        vessel_name: Option<&str>,
        job_number: Option<&str>,
        pod: Option<&str>,
    ) -> Option<Self> {
        Some(Self {
            vessel_name: normalize_field(vessel_name)?,
            job_number: normalize_field(job_number),
            pod: normalize_field(pod),
        })
    }

    #[must_use]
    pub fn identity(&self) -> (&str, Option<&str>) {
        (self.vessel_name.as_str(), self.job_number.as_deref())
    }

    /// Validate field lengths before the key is used to create a vessel.
    ///
    /// # Errors
    /// Returns [`InventoryError::Validation`] when any field exceeds [`MAX_FIELD_LEN`].
    pub fn validate(&self) -> Result<(), InventoryError> {
        for (label, value) in [
            ("vesselName", Some(self.vessel_name.as_str())),
            ("jobNumber", self.job_number.as_deref()),
            ("pod", self.pod.as_deref()),
        ] {
            if let Some(value) = value {
                if value.chars().count() > MAX_FIELD_LEN {
                    return Err(InventoryError::Validation(format!(
                        "{label} MUST be at most {MAX_FIELD_LEN} characters"
                    )));
                }
            }
        }
        Ok(())
    }
}

impl Display for VesselKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}/{}/{}",
            self.vessel_name,
            self.job_number.as_deref().unwrap_or("-"),
            self.pod.as_deref().unwrap_or("-")
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Vessel {
    pub vessel_id: VesselId,
    pub vessel_name: String,
    pub job_number: Option<String>,
    pub pod: Option<String>,
    #[serde(with = "time::serde::rfc3339::option", default)]
    pub etd: Option<OffsetDateTime>,
    pub shipping_line: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

impl Vessel {
    /// Build a fresh vessel record from a normalized key. Blank optional
    /// fields stay absent rather than being stored as empty strings.
    #[must_use]
    pub fn from_key(key: &VesselKey, created_at: OffsetDateTime) -> Self {
        Self {
            vessel_id: VesselId::new(),
            vessel_name: key.vessel_name.clone(),
            job_number: key.job_number.clone(),
            pod: key.pod.clone(),
            etd: None,
            shipping_line: None,
            created_at,
        }
    }

    #[must_use]
    pub fn key(&self) -> VesselKey {
        VesselKey {
            vessel_name: self.vessel_name.clone(),
            job_number: self.job_number.clone(),
            pod: self.pod.clone(),
        }
    }

    /// Validate a vessel against the normalization and length rules.
    ///
    /// # Errors
    /// Returns [`InventoryError::Validation`] when the name is blank, a field is
    /// not in normalized form, or a field is too long.
    pub fn validate(&self) -> Result<(), InventoryError> {
        if self.vessel_name.trim().is_empty() {
            return Err(InventoryError::Validation("vesselName MUST be non-empty".to_string()));
        }

        for (label, value) in [
            ("vesselName", Some(self.vessel_name.as_str())),
            ("jobNumber", self.job_number.as_deref()),
            ("pod", self.pod.as_deref()),
        ] {
            if let Some(value) = value {
                if normalize_field(Some(value)).as_deref() != Some(value) {
                    return Err(InventoryError::Validation(format!(
                        "{label} MUST be trimmed, upper-case and non-empty"
                    )));
                }
            }
        }

        if let Some(shipping_line) = &self.shipping_line {
            if shipping_line.chars().count() > MAX_FIELD_LEN {
                return Err(InventoryError::Validation(format!(
                    "shippingLine MUST be at most {MAX_FIELD_LEN} characters"
                )));
            }
        }

        self.key().validate()
    }
}

/// Unmigrated shipments that share one normalized key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VesselGroup {
    pub key: VesselKey,
    pub shipment_ids: Vec<ShipmentId>,
}

/// Group every unmigrated shipment by normalized key. Groups come back in key
/// order and shipment ids are sorted inside each group; migrated and
/// vessel-free shipments are skipped.
#[must_use]
pub fn group_by_vessel_key(shipments: &[Shipment]) -> Vec<VesselGroup> {
    let mut groups: BTreeMap<VesselKey, Vec<ShipmentId>> = BTreeMap::new();
    for shipment in shipments {
        if shipment.state() != ShipmentState::Unmigrated {
            continue;
        }
        if let Some(key) = shipment.vessel_key() {
            groups.entry(key).or_default().push(shipment.shipment_id);
        }
    }

    groups
        .into_iter()
        .map(|(key, mut shipment_ids)| {
            shipment_ids.sort_unstable();
            VesselGroup { key, shipment_ids }
        })
        .collect()
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct VesselCombination {
    pub vessel_name: String,
    pub job_number: Option<String>,
    pub pod: Option<String>,
    pub shipment_count: u64,
}

impl From<&VesselGroup> for VesselCombination {
    fn from(group: &VesselGroup) -> Self {
        Self {
            vessel_name: group.key.vessel_name.clone(),
            job_number: group.key.job_number.clone(),
            pod: group.key.pod.clone(),
            shipment_count: group.shipment_ids.len() as u64,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct AnalysisReport {
    pub unmigrated_shipments: u64,
    pub migrated_shipments: u64,
    pub vessel_free_shipments: u64,
    pub existing_vessels: u64,
    pub distinct_combinations: u64,
    pub combinations: Vec<VesselCombination>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct DryRunReport {
    pub dry_run: bool,
    pub distinct_combinations: u64,
    pub shipments_to_update: u64,
    pub vessels_to_create: Vec<VesselCombination>,
    pub vessels_to_reuse: u64,
    /// Groups a real run would record in `errors[]` instead of migrating.
    pub invalid_combinations: Vec<GroupError>,
    pub combinations: Vec<VesselCombination>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct GroupError {
    pub vessel_name: String,
    pub job_number: Option<String>,
    pub pod: Option<String>,
    pub error: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct VesselMapEntry {
    pub vessel_name: String,
    pub job_number: Option<String>,
    pub pod: Option<String>,
    pub vessel_id: VesselId,
    pub created: bool,
    pub shipments_updated: u64,
}

/// Outcome of one real execute run. Kept in memory only; the audit trail
/// stores the counts, not the map.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct MigrationLog {
    pub dry_run: bool,
    pub run_id: String,
    pub vessels_created: u64,
    pub shipments_updated: u64,
    pub errors: Vec<GroupError>,
    pub vessel_map: Vec<VesselMapEntry>,
}

impl MigrationLog {
    #[must_use]
    pub fn new(run_id: String) -> Self {
        Self {
            dry_run: false,
            run_id,
            vessels_created: 0,
            shipments_updated: 0,
            errors: Vec::new(),
            vessel_map: Vec::new(),
        }
    }

    pub fn record_success(&mut self, key: &VesselKey, vessel_id: VesselId, created: bool, updated: u64) {
        if created {
            self.vessels_created += 1;
        }
        self.shipments_updated += updated;
        self.vessel_map.push(VesselMapEntry {
            vessel_name: key.vessel_name.clone(),
            job_number: key.job_number.clone(),
            pod: key.pod.clone(),
            vessel_id,
            created,
            shipments_updated: updated,
        });
    }

    pub fn record_failure(&mut self, key: &VesselKey, error: String) {
        self.errors.push(GroupError {
            vessel_name: key.vessel_name.clone(),
            job_number: key.job_number.clone(),
            pod: key.pod.clone(),
            error,
        });
    }

    #[must_use]
    pub fn is_partial_failure(&self) -> bool {
        !self.errors.is_empty()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(untagged)]
pub enum ExecuteReport {
    DryRun(DryRunReport),
    Applied(MigrationLog),
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum VerifyStatus {
    Passed,
    IssuesFound,
}

impl VerifyStatus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Passed => "PASSED",
            Self::IssuesFound => "ISSUES_FOUND",
        }
    }
}

/// `PASSED` only when nothing is left unmigrated, nothing is orphaned and the
/// sample matched.
#[must_use]
pub fn verify_status(unmigrated: u64, orphaned: u64, mismatches: u64) -> VerifyStatus {
    if unmigrated == 0 && orphaned == 0 && mismatches == 0 {
        VerifyStatus::Passed
    } else {
        VerifyStatus::IssuesFound
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum SampleOutcome {
    Match,
    Mismatch,
    Orphaned,
    LegacyCleared,
}

/// Compare the legacy name still on a shipment with the name on its vessel.
#[must_use]
pub fn classify_sample(shipment_vessel_name: Option<&str>, vessel_name: Option<&str>) -> SampleOutcome {
    let Some(vessel_name) = vessel_name else {
        return SampleOutcome::Orphaned;
    };
    match normalize_field(shipment_vessel_name) {
        None => SampleOutcome::LegacyCleared,
        Some(legacy) if normalize_field(Some(vessel_name)).as_deref() == Some(legacy.as_str()) => {
            SampleOutcome::Match
        }
        Some(_) => SampleOutcome::Mismatch,
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SampleItem {
    pub shipment_id: ShipmentId,
    pub vessel_id: VesselId,
    pub shipment_vessel_name: Option<String>,
    pub linked_vessel_name: Option<String>,
    pub outcome: SampleOutcome,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SampleCheck {
    pub requested_size: u32,
    pub size: u64,
    pub mismatches: u64,
    /// True when the sample covered every migrated shipment; otherwise a
    /// `PASSED` verdict for this check is probabilistic.
    pub sampling_is_exhaustive: bool,
    pub items: Vec<SampleItem>,
}

impl SampleCheck {
    #[must_use]
    pub fn from_items(requested_size: u32, migrated_total: u64, items: Vec<SampleItem>) -> Self {
        let size = items.len() as u64;
        let mismatches =
            items.iter().filter(|item| item.outcome == SampleOutcome::Mismatch).count() as u64;
        Self {
            requested_size,
            size,
            mismatches,
            sampling_is_exhaustive: size >= migrated_total,
            items,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct VerifyReport {
    pub status: VerifyStatus,
    pub unmigrated_shipments: u64,
    pub migrated_shipments: u64,
    pub referenced_vessel_ids: u64,
    pub orphan_count: u64,
    pub orphaned_vessel_ids: Vec<VesselId>,
    pub sample: SampleCheck,
}

impl VerifyReport {
    #[must_use]
    pub fn assemble(
        unmigrated_shipments: u64,
        migrated_shipments: u64,
        referenced_vessel_ids: u64,
        orphaned_vessel_ids: Vec<VesselId>,
        sample: SampleCheck,
    ) -> Self {
        let orphan_count = orphaned_vessel_ids.len() as u64;
        Self {
            status: verify_status(unmigrated_shipments, orphan_count, sample.mismatches),
            unmigrated_shipments,
            migrated_shipments,
            referenced_vessel_ids,
            orphan_count,
            orphaned_vessel_ids,
            sample,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct RollbackReport {
    pub confirmed: bool,
    pub shipments_affected: u64,
    pub shipments_reverted: u64,
    pub vessels_preserved: u64,
    pub run_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct LegacyFieldCounts {
    pub with_vessel_name: u64,
    pub with_job_number: u64,
    pub with_pod: u64,
}

impl LegacyFieldCounts {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.with_vessel_name == 0 && self.with_job_number == 0 && self.with_pod == 0
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct CleanupReport {
    pub confirmed: bool,
    pub verify_first: bool,
    pub unmigrated_shipments: u64,
    pub legacy_fields: LegacyFieldCounts,
    pub would_refuse: bool,
    pub shipments_cleaned: u64,
    pub run_id: Option<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum MigrationPhase {
    Analyze,
    Execute,
    Verify,
    Rollback,
    Cleanup,
}

impl MigrationPhase {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Analyze => "analyze",
            Self::Execute => "execute",
            Self::Verify => "verify",
            Self::Rollback => "rollback",
            Self::Cleanup => "cleanup",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "analyze" => Some(Self::Analyze),
            "execute" => Some(Self::Execute),
            "verify" => Some(Self::Verify),
            "rollback" => Some(Self::Rollback),
            "cleanup" => Some(Self::Cleanup),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum RunOutcome {
    Completed,
    CompletedWithErrors,
    Refused,
}

impl RunOutcome {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Completed => "completed",
            Self::CompletedWithErrors => "completed_with_errors",
            Self::Refused => "refused",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "completed" => Some(Self::Completed),
            "completed_with_errors" => Some(Self::CompletedWithErrors),
            "refused" => Some(Self::Refused),
            _ => None,
        }
    }
}

/// Audit row for one mutating phase invocation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MigrationRun {
    pub run_id: String,
    pub phase: MigrationPhase,
    pub dry_run: bool,
    #[serde(with = "time::serde::rfc3339")]
    pub started_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub finished_at: OffsetDateTime,
    pub outcome: RunOutcome,
    pub vessels_created: u64,
    pub shipments_updated: u64,
    pub error_count: u64,
    pub detail: serde_json::Value,
}

#[must_use]
pub fn new_run_id() -> String {
    format!("run_{}", Ulid::new())
}

/// Clamp a requested verify sample size into `1..=MAX_VERIFY_SAMPLE_SIZE`.
#[must_use]
pub fn clamp_sample_size(requested: Option<u32>) -> u32 {
    requested.unwrap_or(DEFAULT_VERIFY_SAMPLE_SIZE).clamp(1, MAX_VERIFY_SAMPLE_SIZE)
}
