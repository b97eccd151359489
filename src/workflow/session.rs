//! Server-side cases linking a first image to its zoom image
//!
//! A case is opened when the first image shows a violation and closed by
//! confirm or reject. Cases idle longer than the TTL expire; their ids are
//! remembered for one more TTL so late requests can be told apart from
//! unknown ids.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::{Duration, Instant};
use thiserror::Error;
use uuid::Uuid;

use crate::storage::{Driver, ViolationType};

/// Lookup failures
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum CaseError {
    #[error("Unknown session {0}")]
    Unknown(Uuid),
    #[error("Session {0} has expired")]
    Expired(Uuid),
}

/// Progress of a case through the workflow
#[derive(Debug, Clone, PartialEq)]
pub enum CaseStage {
    /// Waiting for a zoom image that shows a plate of a registered driver
    AwaitingZoom,
    /// Plate matched; waiting for the officer's decision
    ReadyToConfirm { driver: Driver, plate: String },
}

/// One violation under review
#[derive(Debug, Clone)]
pub struct Case {
    pub id: Uuid,
    pub violation: ViolationType,
    pub first_image: PathBuf,
    pub zoom_image: Option<PathBuf>,
    /// Plate crop read from the current zoom image
    pub plate_crop: Option<PathBuf>,
    pub stage: CaseStage,
    last_activity: Instant,
}

impl Case {
    pub fn new(id: Uuid, violation: ViolationType, first_image: PathBuf) -> Self {
        Self {
            id,
            violation,
            first_image,
            zoom_image: None,
            plate_crop: None,
            stage: CaseStage::AwaitingZoom,
            last_activity: Instant::now(),
        }
    }

    /// First 8 characters of the id, used to tag archived files
    pub fn short_id(&self) -> String {
        self.id.simple().to_string()[..8].to_string()
    }

    fn is_expired(&self, ttl: Duration) -> bool {
        self.last_activity.elapsed() >= ttl
    }

    fn is_ready(&self) -> bool {
        matches!(self.stage, CaseStage::ReadyToConfirm { .. })
    }

    /// Files of `self` that `next` no longer references
    fn replaced_files(&self, next: &Case) -> Vec<PathBuf> {
        [
            (&self.zoom_image, &next.zoom_image),
            (&self.plate_crop, &next.plate_crop),
        ]
        .into_iter()
        .filter_map(|(old, new)| match old {
            Some(old) if new.as_ref() != Some(old) => Some(old.clone()),
            _ => None,
        })
        .collect()
    }
}

/// In-memory case registry shared by all requests
pub struct CaseStore {
    ttl: Duration,
    cases: Mutex<HashMap<Uuid, Case>>,
    /// Ids of expired cases and when they were swept
    expired: Mutex<HashMap<Uuid, Instant>>,
}

impl CaseStore {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            cases: Mutex::new(HashMap::new()),
            expired: Mutex::new(HashMap::new()),
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Register a new case
    pub fn open(&self, case: Case) {
        self.cases.lock().insert(case.id, case);
    }

    /// Snapshot of a live case
    pub fn get(&self, id: &Uuid) -> Result<Case, CaseError> {
        self.live(&self.cases.lock(), id).cloned()
    }

    /// Store a modified case and reset its idle timer. Fails if the case was
    /// closed or expired in the meantime.
    ///
    /// Returns the zoom image and plate crop the stored case referenced but
    /// `case` no longer does, for the caller to delete.
    pub fn update(&self, mut case: Case) -> Result<Vec<PathBuf>, CaseError> {
        let mut cases = self.cases.lock();
        match cases.get(&case.id) {
            Some(current) if current.is_expired(self.ttl) => Err(CaseError::Expired(case.id)),
            Some(current) => {
                let replaced = current.replaced_files(&case);
                case.last_activity = Instant::now();
                cases.insert(case.id, case);
                Ok(replaced)
            }
            None => Err(CaseError::Unknown(case.id)),
        }
    }

    /// Remove a live case. Once taken, no other request can see it.
    pub fn take(&self, id: &Uuid) -> Result<Case, CaseError> {
        let mut cases = self.cases.lock();
        self.live(&cases, id)?;
        cases.remove(id).ok_or(CaseError::Unknown(*id))
    }

    /// Remove a case only if it is ready to confirm. `Ok(None)` means the
    /// case is live but has no matched driver; it stays open.
    pub fn take_ready(&self, id: &Uuid) -> Result<Option<Case>, CaseError> {
        let mut cases = self.cases.lock();
        if self.live(&cases, id)?.is_ready() {
            Ok(cases.remove(id))
        } else {
            Ok(None)
        }
    }

    fn live<'a>(&self, cases: &'a HashMap<Uuid, Case>, id: &Uuid) -> Result<&'a Case, CaseError> {
        match cases.get(id) {
            Some(case) if case.is_expired(self.ttl) => Err(CaseError::Expired(*id)),
            Some(case) => Ok(case),
            None if self.expired.lock().contains_key(id) => Err(CaseError::Expired(*id)),
            None => Err(CaseError::Unknown(*id)),
        }
    }

    /// Put back a taken case whose closing failed
    pub fn reopen(&self, case: Case) {
        self.cases.lock().entry(case.id).or_insert(case);
    }

    /// Remove every expired case and return them so their files can be
    /// deleted. Tombstones older than another TTL are forgotten.
    pub fn sweep_expired(&self) -> Vec<Case> {
        let now = Instant::now();
        let swept: Vec<Case> = {
            let mut cases = self.cases.lock();
            let ids: Vec<Uuid> = cases
                .values()
                .filter(|c| c.is_expired(self.ttl))
                .map(|c| c.id)
                .collect();
            ids.iter().filter_map(|id| cases.remove(id)).collect()
        };

        let mut expired = self.expired.lock();
        expired.retain(|_, at| now.duration_since(*at) < self.ttl);
        for case in &swept {
            expired.insert(case.id, now);
        }

        swept
    }

    /// Number of live cases
    pub fn len(&self) -> usize {
        self.cases.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
