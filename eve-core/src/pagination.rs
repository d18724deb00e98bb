use chrono::{DateTime, Utc};
use futures::future::join_all;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{event, trace_span, Instrument, Level};

use crate::esi_client::{EsiClientTrait, PaginatedResource};
use eve_domain::{Error, Result};

/// The page queue never grows beyond this, whatever the upstream claims.
const PAGE_QUEUE_CAP: usize = 400;

/// Everything a paginated fetch produced. Pages are keyed by page number;
/// gaps mean the deadline or a transient failure ate them.
#[derive(Debug, Clone, PartialEq)]
pub struct PageSet {
    pub pages: BTreeMap<u32, Vec<u8>>,
    pub complete: bool,
    pub not_modified: bool,
    /// Minimum of all observed page expiries, i.e. the most pessimistic.
    pub expires_at: Option<DateTime<Utc>>,
}

impl PageSet {
    pub fn bodies_in_order(&self) -> Vec<&[u8]> {
        self.pages.values().map(|body| body.as_slice()).collect()
    }
}

/// Fetches every page of a paginated upstream resource with a bounded
/// worker pool under a deadline. Page 1 always goes first so the total
/// page count is known before the fan-out starts.
#[derive(Debug, Clone)]
pub struct BatchPager {
    client: Arc<dyn EsiClientTrait>,
    workers: usize,
}

struct BatchState {
    results: Mutex<BTreeMap<u32, Vec<u8>>>,
    min_expires: Mutex<Option<DateTime<Utc>>>,
    degraded: AtomicBool,
    fatal: Mutex<Option<Error>>,
}

impl BatchState {
    async fn merge_expires(&self, expires_at: Option<DateTime<Utc>>) {
        if let Some(expires_at) = expires_at {
            let mut guard = self.min_expires.lock().await;
            *guard = Some(match *guard {
                Some(current) => current.min(expires_at),
                None => expires_at,
            });
        }
    }
}

impl BatchPager {
    pub fn new(client: Arc<dyn EsiClientTrait>, workers: usize) -> Self {
        Self {
            client,
            workers: workers.max(1),
        }
    }

    pub async fn fetch_all_pages(&self, resource: PaginatedResource, deadline: Instant, cancel: CancellationToken) -> Result<PageSet> {
        let span = trace_span!("pagination", path = %resource.path);
        self.fetch_all_pages_inner(resource, deadline, cancel).instrument(span).await
    }

    async fn fetch_all_pages_inner(&self, resource: PaginatedResource, deadline: Instant, cancel: CancellationToken) -> Result<PageSet> {
        let first = tokio::time::timeout_at(deadline, self.client.get_page(&resource, 1, cancel.clone()))
            .await
            .map_err(|_| Error::transient(format!("deadline expired before page 1 of {}", resource.path)))??;

        if first.not_modified {
            return Ok(PageSet {
                pages: BTreeMap::new(),
                complete: true,
                not_modified: true,
                expires_at: first.expires_at,
            });
        }

        let total_pages = first.pages.unwrap_or(1).max(1);
        event!(Level::TRACE, "Page 1 of {} declares {} total pages", resource.path, total_pages);

        let state = Arc::new(BatchState {
            results: Mutex::new(BTreeMap::from([(1, first.body)])),
            min_expires: Mutex::new(first.expires_at),
            degraded: AtomicBool::new(false),
            fatal: Mutex::new(None),
        });

        if total_pages > 1 {
            // a child token lets a fatal page kill its peers without
            // cancelling the caller
            let batch_cancel = cancel.child_token();

            let queue_cap = ((total_pages - 1) as usize).min(PAGE_QUEUE_CAP);
            let (tx, rx) = mpsc::channel::<u32>(queue_cap);
            let rx = Arc::new(Mutex::new(rx));

            let producer = tokio::spawn(async move {
                for page_no in 2..=total_pages {
                    if tx.send(page_no).await.is_err() {
                        break;
                    }
                }
            });

            let worker_count = self.workers.min((total_pages - 1) as usize);
            let workers: Vec<_> = (0..worker_count)
                .map(|_| {
                    let client = Arc::clone(&self.client);
                    let resource = resource.clone();
                    let state = Arc::clone(&state);
                    let rx = Arc::clone(&rx);
                    let batch_cancel = batch_cancel.clone();
                    tokio::spawn(async move {
                        loop {
                            let page_no = { rx.lock().await.recv().await };
                            let Some(page_no) = page_no else {
                                break;
                            };

                            if batch_cancel.is_cancelled() || Instant::now() >= deadline {
                                state.degraded.store(true, Ordering::SeqCst);
                                break;
                            }

                            match tokio::time::timeout_at(deadline, client.get_page(&resource, page_no, batch_cancel.clone())).await {
                                Err(_elapsed) => {
                                    state.degraded.store(true, Ordering::SeqCst);
                                    break;
                                }
                                Ok(Ok(page)) => {
                                    state.merge_expires(page.expires_at).await;
                                    state.results.lock().await.insert(page_no, page.body);
                                }
                                Ok(Err(e)) if matches!(e, Error::Transient(_) | Error::RateLimited(_)) => {
                                    // this page is lost for the batch, its peers are not
                                    event!(Level::WARN, "Page {} of {} failed after retries: {}", page_no, resource.path, e);
                                    state.degraded.store(true, Ordering::SeqCst);
                                }
                                Ok(Err(e)) => {
                                    *state.fatal.lock().await = Some(e);
                                    batch_cancel.cancel();
                                    break;
                                }
                            }
                        }
                    })
                })
                .collect();

            join_all(workers).await;
            producer.abort();
        }

        if let Some(fatal) = state.fatal.lock().await.take() {
            return Err(fatal);
        }

        let pages = std::mem::take(&mut *state.results.lock().await);
        let complete = !state.degraded.load(Ordering::SeqCst) && pages.len() == total_pages as usize;
        let expires_at = *state.min_expires.lock().await;

        event!(
            Level::TRACE,
            "Fetched {}/{} pages of {} (complete: {})",
            pages.len(),
            total_pages,
            resource.path,
            complete
        );

        Ok(PageSet {
            pages,
            complete,
            not_modified: false,
            expires_at,
        })
    }
}
