use super::{CommitReceipt, LabStore, UnitOfWork};
use crate::audit::{AuditChain, AuditEvent};
use crate::error::{LimsError, StorageError};
use crate::types::{Analysis, AnalysisId, BatchId, EntityRef, Sample, SampleId};
use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;

#[derive(Debug, Default)]
struct Inner {
    samples: HashMap<SampleId, Sample>,
    analyses: HashMap<AnalysisId, Analysis>,
    analysis_order: HashMap<SampleId, Vec<AnalysisId>>,
    audit: AuditChain,
}

/// In-memory [`LabStore`]
///
/// One write lock per commit: preconditions are checked and every write is
/// applied while it is held, so a unit of work is either fully visible or
/// not at all.
#[derive(Debug, Default)]
pub struct MemoryStore {
    inner: RwLock<Inner>,
    injected_fault: Mutex<Option<StorageError>>,
}

impl MemoryStore {
    /// Create an empty store
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next commit with `error`, leaving state untouched
    pub fn fail_next_commit(&self, error: StorageError) {
        *self.injected_fault.lock() = Some(error);
    }

    /// Full audit log, oldest first
    #[must_use]
    pub fn audit_log(&self) -> Vec<AuditEvent> {
        self.inner.read().audit.events().to_vec()
    }

    fn check(inner: &Inner, work: &UnitOfWork) -> Result<(), LimsError> {
        for sample in &work.new_samples {
            if inner.samples.contains_key(&sample.id) {
                return Err(StorageError::Duplicate(format!("sample {}", sample.id)).into());
            }
            if inner.samples.values().any(|s| s.code == sample.code) {
                return Err(StorageError::Duplicate(format!("sample code {}", sample.code)).into());
            }
        }

        for analysis in &work.new_analyses {
            if inner.analyses.contains_key(&analysis.id) {
                return Err(StorageError::Duplicate(format!("analysis {}", analysis.id)).into());
            }
            let owner_known = inner.samples.contains_key(&analysis.sample_id)
                || work.new_samples.iter().any(|s| s.id == analysis.sample_id);
            if !owner_known {
                return Err(LimsError::NotFound(EntityRef::Sample(analysis.sample_id)));
            }
        }

        for write in &work.analysis_writes {
            let current = inner
                .analyses
                .get(&write.analysis.id)
                .ok_or(LimsError::NotFound(EntityRef::Analysis(write.analysis.id)))?;
            if current.status != write.expected_status {
                return Err(LimsError::stale(
                    EntityRef::Analysis(current.id),
                    write.expected_status,
                    current.status,
                ));
            }
        }

        for change in &work.status_changes {
            let current = inner
                .samples
                .get(&change.sample_id)
                .ok_or(LimsError::NotFound(EntityRef::Sample(change.sample_id)))?;
            if current.status != change.from {
                return Err(LimsError::stale(
                    EntityRef::Sample(change.sample_id),
                    change.from,
                    current.status,
                ));
            }
        }

        for guard in &work.sample_guards {
            let current = inner
                .samples
                .get(&guard.sample_id)
                .ok_or(LimsError::NotFound(EntityRef::Sample(guard.sample_id)))?;
            if current.status != guard.expected_status {
                return Err(LimsError::stale(
                    EntityRef::Sample(guard.sample_id),
                    guard.expected_status,
                    current.status,
                ));
            }
        }
        Ok(())
    }
}

impl LabStore for MemoryStore {
    fn sample(&self, id: SampleId) -> Result<Sample, LimsError> {
        self.inner
            .read()
            .samples
            .get(&id)
            .cloned()
            .ok_or(LimsError::NotFound(EntityRef::Sample(id)))
    }

    fn sample_by_code(&self, code: &str) -> Result<Option<Sample>, LimsError> {
        Ok(self
            .inner
            .read()
            .samples
            .values()
            .find(|s| s.code == code)
            .cloned())
    }

    fn samples_for_batch(&self, batch_id: BatchId) -> Result<Vec<Sample>, LimsError> {
        let inner = self.inner.read();
        let mut samples: Vec<Sample> = inner
            .samples
            .values()
            .filter(|s| s.production_batch_id == Some(batch_id))
            .cloned()
            .collect();
        samples.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.code.cmp(&b.code)));
        Ok(samples)
    }

    fn analyses_for_sample(&self, sample_id: SampleId) -> Result<Vec<Analysis>, LimsError> {
        let inner = self.inner.read();
        if !inner.samples.contains_key(&sample_id) {
            return Err(LimsError::NotFound(EntityRef::Sample(sample_id)));
        }
        Ok(inner
            .analysis_order
            .get(&sample_id)
            .map(|ids| ids.iter().filter_map(|id| inner.analyses.get(id).cloned()).collect())
            .unwrap_or_default())
    }

    fn analysis(&self, id: AnalysisId) -> Result<Analysis, LimsError> {
        self.inner
            .read()
            .analyses
            .get(&id)
            .cloned()
            .ok_or(LimsError::NotFound(EntityRef::Analysis(id)))
    }

    fn audit_trail(&self, sample_id: SampleId) -> Result<Vec<AuditEvent>, LimsError> {
        Ok(self
            .inner
            .read()
            .audit
            .events()
            .iter()
            .filter(|e| e.sample_id == sample_id)
            .cloned()
            .collect())
    }

    fn commit(&self, work: UnitOfWork) -> Result<CommitReceipt, LimsError> {
        let mut inner = self.inner.write();

        if let Some(fault) = self.injected_fault.lock().take() {
            tracing::warn!(error = %fault, "injected storage fault");
            return Err(fault.into());
        }

        Self::check(&inner, &work)?;

        // Seal audit events before touching state so an encoding failure
        // leaves nothing behind.
        let mut sealed: Vec<AuditEvent> = Vec::with_capacity(work.audit_events.len());
        for event in work.audit_events {
            let next = inner
                .audit
                .seal(sealed.last(), event)
                .map_err(StorageError::from)?;
            sealed.push(next);
        }

        for sample in work.new_samples {
            inner.analysis_order.entry(sample.id).or_default();
            inner.samples.insert(sample.id, sample);
        }
        for analysis in work.new_analyses {
            inner
                .analysis_order
                .entry(analysis.sample_id)
                .or_default()
                .push(analysis.id);
            inner.analyses.insert(analysis.id, analysis);
        }
        for write in work.analysis_writes {
            inner.analyses.insert(write.analysis.id, write.analysis);
        }
        for change in &work.status_changes {
            if let Some(sample) = inner.samples.get_mut(&change.sample_id) {
                sample.status = change.to;
                if let Some((at, by)) = change.collected {
                    sample.collected_at = Some(at);
                    sample.collected_by = Some(by);
                }
            }
        }

        let events = sealed.iter().map(|e| e.event_id).collect();
        inner.audit.extend_sealed(sealed);

        Ok(CommitReceipt {
            events,
            committed_at: Utc::now(),
        })
    }

    fn verify_audit_chain(&self) -> Result<usize, LimsError> {
        let inner = self.inner.read();
        inner
            .audit
            .verify_integrity()
            .map_err(StorageError::from)?;
        Ok(inner.audit.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::{AuditAction, Snapshot};
    use crate::types::{ActorId, AnalysisStatus, OrganizationId, PlantId, SampleStatus};
    use lims_conformity::{ParameterId, Role, SampleTypeId};
    use std::sync::{Arc, Barrier};

    fn sample(status: SampleStatus) -> Sample {
        Sample {
            id: SampleId::new(),
            code: format!("S-{}", SampleId::new()),
            organization_id: OrganizationId::new(),
            plant_id: PlantId::new(),
            sample_type_id: SampleTypeId::new(),
            product_id: None,
            production_batch_id: None,
            intermediate_product_id: None,
            sampling_point_id: None,
            collected_at: None,
            collected_by: None,
            status,
            created_at: Utc::now(),
            created_by: ActorId::new(),
        }
    }

    fn seeded(status: SampleStatus) -> (MemoryStore, Sample, Analysis) {
        let store = MemoryStore::new();
        let s = sample(status);
        let a = Analysis::pending(s.id, ParameterId::new(), None);
        let mut work = UnitOfWork::new();
        work.insert_sample(s.clone()).insert_analysis(a.clone());
        store.commit(work).unwrap();
        (store, s, a)
    }

    fn event(sample_id: SampleId) -> AuditEvent {
        AuditEvent::new(
            ActorId::new(),
            Role::QcSupervisor,
            sample_id,
            AuditAction::ReviewApproved,
            Snapshot::status(SampleStatus::UnderReview),
            Snapshot::status(SampleStatus::Approved),
            Utc::now(),
        )
    }

    #[test]
    fn test_commit_applies_everything() {
        let (store, s, a) = seeded(SampleStatus::UnderReview);
        let mut updated = a.clone();
        updated.status = AnalysisStatus::Reviewed;

        let mut work = UnitOfWork::new();
        work.persist_analysis(updated, AnalysisStatus::Pending)
            .persist_sample_status(s.id, SampleStatus::UnderReview, SampleStatus::Approved)
            .append_audit_event(event(s.id));
        let receipt = store.commit(work).unwrap();

        assert_eq!(receipt.events.len(), 1);
        assert_eq!(store.sample(s.id).unwrap().status, SampleStatus::Approved);
        assert_eq!(store.analysis(a.id).unwrap().status, AnalysisStatus::Reviewed);
        assert_eq!(store.audit_trail(s.id).unwrap().len(), 1);
        assert_eq!(store.verify_audit_chain().unwrap(), 1);
    }

    #[test]
    fn test_stale_precondition_applies_nothing() {
        let (store, s, a) = seeded(SampleStatus::UnderReview);
        let mut updated = a.clone();
        updated.status = AnalysisStatus::Reviewed;

        let mut work = UnitOfWork::new();
        work.persist_analysis(updated, AnalysisStatus::Pending)
            .persist_sample_status(s.id, SampleStatus::Approved, SampleStatus::Released)
            .append_audit_event(event(s.id));
        let err = store.commit(work).unwrap_err();

        assert!(err.requires_reload());
        assert_eq!(store.analysis(a.id).unwrap().status, AnalysisStatus::Pending);
        assert!(store.audit_trail(s.id).unwrap().is_empty());
    }

    #[test]
    fn test_sample_guard_blocks_analysis_write() {
        let (store, s, a) = seeded(SampleStatus::InAnalysis);
        let mut move_on = UnitOfWork::new();
        move_on.persist_sample_status(s.id, SampleStatus::InAnalysis, SampleStatus::UnderReview);
        store.commit(move_on).unwrap();

        let mut started = a.clone();
        started.status = AnalysisStatus::Started;
        let mut work = UnitOfWork::new();
        work.persist_analysis(started, AnalysisStatus::Pending)
            .expect_sample_status(s.id, SampleStatus::InAnalysis);
        let err = store.commit(work).unwrap_err();

        assert!(matches!(
            err,
            LimsError::ConcurrentModification {
                entity: EntityRef::Sample(id),
                ..
            } if id == s.id
        ));
        assert_eq!(store.analysis(a.id).unwrap().status, AnalysisStatus::Pending);
    }

    #[test]
    fn test_injected_fault_applies_nothing() {
        let (store, s, _) = seeded(SampleStatus::UnderReview);
        store.fail_next_commit(StorageError::Timeout);

        let mut work = UnitOfWork::new();
        work.persist_sample_status(s.id, SampleStatus::UnderReview, SampleStatus::Approved);
        let err = store.commit(work).unwrap_err();
        assert!(err.is_retryable());
        assert_eq!(store.sample(s.id).unwrap().status, SampleStatus::UnderReview);
    }

    #[test]
    fn test_duplicate_code_rejected() {
        let (store, s, _) = seeded(SampleStatus::Registered);
        let mut twin = sample(SampleStatus::Registered);
        twin.code = s.code.clone();
        let mut work = UnitOfWork::new();
        work.insert_sample(twin);
        assert!(matches!(
            store.commit(work),
            Err(LimsError::StorageFailure(StorageError::Duplicate(_)))
        ));
    }

    #[test]
    fn test_racing_threads_commit_once() {
        let (store, s, _) = seeded(SampleStatus::UnderReview);
        let store = Arc::new(store);
        let barrier = Arc::new(Barrier::new(2));
        let sample_id = s.id;

        let handles: Vec<_> = (0..2)
            .map(|_| {
                let store = Arc::clone(&store);
                let barrier = Arc::clone(&barrier);
                std::thread::spawn(move || {
                    let mut work = UnitOfWork::new();
                    work.persist_sample_status(sample_id, SampleStatus::UnderReview, SampleStatus::Approved)
                        .append_audit_event(event(sample_id));
                    barrier.wait();
                    store.commit(work)
                })
            })
            .collect();

        let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
        assert!(results
            .iter()
            .any(|r| matches!(r, Err(LimsError::ConcurrentModification { .. }))));
        assert_eq!(store.audit_trail(s.id).unwrap().len(), 1);
    }
}
