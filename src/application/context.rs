use std::{sync::Arc, time::Duration};

use crate::{
    application::{
        gallery::GalleryService,
        ledger::JobLedger,
        ports::{ArtifactStore, WorkQueue},
        repos::{GalleryRepo, HistoryRepo},
        status::StatusResolver,
        submit::SubmissionService,
    },
    cache::ReadCache,
    domain::lifecycle::StalenessPolicy,
};

/// Collaborators shared by submission, status, gallery and the worker.
#[derive(Clone)]
pub struct PipelineContext {
    pub ledger: JobLedger,
    pub gallery: Arc<dyn GalleryRepo>,
    pub history: Arc<dyn HistoryRepo>,
    pub queue: Arc<dyn WorkQueue>,
    pub artifacts: Arc<dyn ArtifactStore>,
    pub read_cache: ReadCache,
    pub staleness: StalenessPolicy,
    pub presign_ttl: Duration,
}

impl PipelineContext {
    pub fn submissions(&self) -> SubmissionService {
        SubmissionService::new(self.clone())
    }

    pub fn status_resolver(&self) -> StatusResolver {
        StatusResolver::new(
            self.ledger.clone(),
            self.history.clone(),
            self.artifacts.clone(),
            self.staleness,
            self.presign_ttl,
        )
    }

    pub fn galleries(&self) -> GalleryService {
        GalleryService::new(self.clone())
    }
}
