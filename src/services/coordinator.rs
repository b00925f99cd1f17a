use crate::error::PipelineError;
use crate::models::Resource;
use crate::services::fetcher::{Fetch, FetchRequest};
use std::sync::Arc;
use tokio::sync::Semaphore;

/// Upper bound on simultaneous fetches against the source site.
pub const MAX_WORKERS: usize = 10;

pub struct FetchTask<C> {
    pub request: FetchRequest,
    pub context: C,
}

pub struct TaskOutcome<C> {
    pub context: C,
    pub url: String,
    pub result: Result<Resource, PipelineError>,
}

/// One outcome per submitted task, in submission order.
pub struct FetchReport<C> {
    pub outcomes: Vec<TaskOutcome<C>>,
}

impl<C> FetchReport<C> {
    pub fn succeeded(&self) -> usize {
        self.outcomes.iter().filter(|o| o.result.is_ok()).count()
    }

    pub fn failed(&self) -> usize {
        self.outcomes.len() - self.succeeded()
    }

    pub fn any_succeeded(&self) -> bool {
        self.outcomes.iter().any(|o| o.result.is_ok())
    }
}

/// Runs independent fetches on a bounded number of concurrent workers. A failing
/// task never affects its siblings and there is no retry at this level.
pub struct FetchCoordinator<F> {
    fetcher: Arc<F>,
    workers: usize,
}

impl<F: Fetch> FetchCoordinator<F> {
    pub fn new(fetcher: Arc<F>, workers: usize) -> Self {
        Self {
            fetcher,
            workers: workers.clamp(1, MAX_WORKERS),
        }
    }

    pub fn workers(&self) -> usize {
        self.workers
    }

    pub async fn run<C: Send + 'static>(&self, tasks: Vec<FetchTask<C>>) -> FetchReport<C> {
        let permits = Arc::new(Semaphore::new(self.workers));
        let mut pending = Vec::with_capacity(tasks.len());

        for task in tasks {
            let fetcher = Arc::clone(&self.fetcher);
            let permits = Arc::clone(&permits);
            let url = task.request.url.clone();
            let request = task.request;

            let handle = tokio::spawn(async move {
                let _permit = permits
                    .acquire_owned()
                    .await
                    .map_err(|e| PipelineError::Task(e.to_string()))?;
                fetcher.fetch(request).await
            });
            pending.push((task.context, url, handle));
        }

        let mut outcomes = Vec::with_capacity(pending.len());
        for (context, url, handle) in pending {
            let result = match handle.await {
                Ok(result) => result,
                Err(e) => {
                    tracing::warn!("fetch task for {} did not finish: {}", url, e);
                    Err(PipelineError::Task(e.to_string()))
                }
            };
            outcomes.push(TaskOutcome {
                context,
                url,
                result,
            });
        }

        let report = FetchReport { outcomes };
        tracing::info!(
            succeeded = report.succeeded(),
            failed = report.failed(),
            workers = self.workers,
            "fetch stage finished"
        );
        report
    }
}
