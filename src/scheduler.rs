use std::time::Duration;

use futures::stream::{self, Stream, StreamExt};
use log::warn;

use crate::error::FetchError;
use crate::model::{DetailFields, DocumentReference};
use crate::sites::SiteAdapter;

/// One finished detail fetch. A failure is already folded into `detail` as an
/// error-marker value; `error` keeps the cause for reporting.
#[derive(Debug, Clone)]
pub struct Completed {
    pub reference: DocumentReference,
    pub detail: DetailFields,
    pub error: Option<FetchError>,
}

/// Runs detail fetches with a fixed ceiling on calls in flight.
#[derive(Debug, Clone, Copy)]
pub struct FetchScheduler {
    concurrency: usize,
    timeout: Duration,
}

impl FetchScheduler {
    pub fn new(concurrency: usize, timeout: Duration) -> Self {
        FetchScheduler {
            concurrency: concurrency.max(1),
            timeout,
        }
    }

    pub fn concurrency(&self) -> usize {
        self.concurrency
    }

    /// Yields exactly one `Completed` per reference, in completion order.
    /// Each fetch is cut off after the per-fetch timeout.
    pub fn dispatch<'a, A>(
        &self,
        adapter: &'a A,
        references: Vec<DocumentReference>,
    ) -> impl Stream<Item = Completed> + 'a
    where
        A: SiteAdapter + ?Sized,
    {
        let timeout = self.timeout;
        stream::iter(references)
            .map(move |reference| async move {
                let result = match tokio::time::timeout(timeout, adapter.fetch_detail(&reference)).await {
                    Ok(result) => result,
                    Err(_) => Err(FetchError::Timeout(timeout)),
                };
                match result {
                    Ok(detail) => Completed {
                        reference,
                        detail,
                        error: None,
                    },
                    Err(e) => {
                        warn!("Detail fetch failed for {}: {}", reference.link, e);
                        Completed {
                            detail: DetailFields::failed(&e),
                            reference,
                            error: Some(e),
                        }
                    }
                }
            })
            .buffer_unordered(self.concurrency)
    }
}
