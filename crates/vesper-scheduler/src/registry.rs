//! Job type to handler mapping.

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use tracing::debug;

use crate::{Job, SchedulerError};

/// Logic that performs the work for one job type.
///
/// Returning `Err` marks the execution as failed; the scheduler decides
/// whether the job is retried or marked failed.
#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn handle(&self, job: Job) -> Result<(), String>;
}

#[async_trait]
impl<F, Fut> JobHandler for F
where
    F: Fn(Job) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), String>> + Send,
{
    async fn handle(&self, job: Job) -> Result<(), String> {
        (self)(job).await
    }
}

/// Handlers keyed by job type.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: DashMap<String, Arc<dyn JobHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` for `job_type`, replacing any previous registration.
    pub fn register<H>(&self, job_type: &str, handler: H) -> Result<(), SchedulerError>
    where
        H: JobHandler + 'static,
    {
        if job_type.trim().is_empty() {
            return Err(SchedulerError::InvalidJobType(job_type.to_string()));
        }

        if self
            .handlers
            .insert(job_type.to_string(), Arc::new(handler))
            .is_some()
        {
            debug!(job_type, "replaced job handler");
        } else {
            debug!(job_type, "registered job handler");
        }
        Ok(())
    }

    /// Look up the handler for `job_type`.
    pub fn get(&self, job_type: &str) -> Option<Arc<dyn JobHandler>> {
        self.handlers.get(job_type).map(|h| Arc::clone(h.value()))
    }

    pub fn contains(&self, job_type: &str) -> bool {
        self.handlers.contains_key(job_type)
    }

    /// Registered job types, sorted.
    pub fn job_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self.handlers.iter().map(|e| e.key().clone()).collect();
        types.sort();
        types
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}
