//! Resource fetcher abstraction.

use crate::auth::AuthenticatedClient;
use crate::error::{EngineError, EngineResult};
use async_trait::async_trait;
use fhirsync_model::{FetchRequest, FetchedResources};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::time::Duration;

/// Retrieves raw resources from the remote FHIR server.
///
/// Implementations walk bundle pages internally and return every
/// matching resource grouped by type. Resources are returned untouched;
/// normalization is the mapper's job.
#[async_trait]
pub trait ResourceFetcher: Send + Sync {
    /// Fetches resources matching the request.
    async fn fetch(
        &self,
        client: &AuthenticatedClient,
        request: &FetchRequest,
    ) -> EngineResult<FetchedResources>;
}

enum Scripted {
    Resources(FetchedResources),
    Error(EngineError),
}

/// A scripted fetcher for testing.
///
/// Queued outcomes are consumed first; once the queue is empty the
/// standing response is returned on every call.
#[derive(Default)]
pub struct MockFetcher {
    queue: Mutex<VecDeque<Scripted>>,
    standing: Mutex<FetchedResources>,
    requests: Mutex<Vec<FetchRequest>>,
    delay: Mutex<Option<Duration>>,
}

impl MockFetcher {
    /// Creates a fetcher that returns nothing.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the response returned when the queue is empty.
    pub fn set_response(&self, resources: FetchedResources) {
        *self.standing.lock() = resources;
    }

    /// Queues a one-shot response.
    pub fn push_response(&self, resources: FetchedResources) {
        self.queue.lock().push_back(Scripted::Resources(resources));
    }

    /// Queues a one-shot failure.
    pub fn push_error(&self, error: EngineError) {
        self.queue.lock().push_back(Scripted::Error(error));
    }

    /// Makes every fetch wait before answering.
    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock() = Some(delay);
    }

    /// Returns all requests received so far.
    pub fn requests(&self) -> Vec<FetchRequest> {
        self.requests.lock().clone()
    }

    /// Returns the most recent request.
    pub fn last_request(&self) -> Option<FetchRequest> {
        self.requests.lock().last().cloned()
    }
}

#[async_trait]
impl ResourceFetcher for MockFetcher {
    async fn fetch(
        &self,
        _client: &AuthenticatedClient,
        request: &FetchRequest,
    ) -> EngineResult<FetchedResources> {
        self.requests.lock().push(request.clone());

        let delay = *self.delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let next = self.queue.lock().pop_front();
        match next {
            Some(Scripted::Resources(resources)) => Ok(resources),
            Some(Scripted::Error(error)) => Err(error),
            None => Ok(self.standing.lock().clone()),
        }
    }
}
