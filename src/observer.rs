use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use futures::{FutureExt, Stream, StreamExt};
use tokio::sync::{Semaphore, mpsc};
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::{debug, trace};

use crate::diff::{EditScript, diff};
use crate::domain::Record;
use crate::query::{LoadState, Query};
use crate::store::{MutationStream, RecordStore};

pub type ObservedChange = LoadState<EditScript<Record>>;

/// Entry point for live queries over a [`RecordStore`].
pub struct LiveQuery;

impl LiveQuery {
    /// Starts observing `query`. Nothing is emitted until demand is granted
    /// with [`Observation::request`]; the first permitted emission is the
    /// baseline (an edit script from the empty list), even when empty.
    pub fn observe(store: Arc<dyn RecordStore>, query: Query) -> Observation {
        let demand = Arc::new(Semaphore::new(0));
        let token = CancellationToken::new();
        let (sender, receiver) = mpsc::unbounded_channel();
        let mutations = store.subscribe(&query.source);
        let driver = Driver {
            store,
            query,
            demand: demand.clone(),
            token: token.clone(),
            sender,
        };
        tokio::spawn(driver.run(mutations));
        Observation {
            demand,
            receiver,
            _guard: token.clone().drop_guard(),
            token,
        }
    }
}

/// Consumer half of a live query. Dropping it cancels the observation.
pub struct Observation {
    demand: Arc<Semaphore>,
    receiver: mpsc::UnboundedReceiver<ObservedChange>,
    token: CancellationToken,
    _guard: DropGuard,
}

impl Observation {
    /// Grants `additional` more emissions.
    pub fn request(&self, additional: usize) {
        if self.token.is_cancelled() {
            return;
        }
        let room = Semaphore::MAX_PERMITS.saturating_sub(self.demand.available_permits());
        self.demand.add_permits(additional.min(room));
    }

    pub async fn next(&mut self) -> Option<ObservedChange> {
        if self.token.is_cancelled() {
            return None;
        }
        tokio::select! {
            biased;
            _ = self.token.cancelled() => None,
            change = self.receiver.recv() => change.filter(|_| !self.token.is_cancelled()),
        }
    }

    pub fn cancel(&self) {
        self.token.cancel();
        self.demand.close();
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Token that cancels this observation from elsewhere.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.token.clone()
    }
}

impl Stream for Observation {
    type Item = ObservedChange;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        if self.token.is_cancelled() {
            return Poll::Ready(None);
        }
        self.receiver.poll_recv(cx)
    }
}

struct Driver {
    store: Arc<dyn RecordStore>,
    query: Query,
    demand: Arc<Semaphore>,
    token: CancellationToken,
    sender: mpsc::UnboundedSender<ObservedChange>,
}

impl Driver {
    async fn run(self, mutations: MutationStream) {
        let mut mutations = Some(mutations);
        let mut snapshot: Vec<Record> = Vec::new();
        let mut first = true;
        let mut dirty = true;

        loop {
            while !dirty {
                let Some(stream) = mutations.as_mut() else {
                    debug!(source = %self.query.source, "mutation feed closed");
                    return;
                };
                tokio::select! {
                    biased;
                    _ = self.token.cancelled() => return,
                    mutation = stream.next() => match mutation {
                        Some(_) => dirty = true,
                        None => mutations = None,
                    },
                }
            }

            let permit = loop {
                tokio::select! {
                    biased;
                    _ = self.token.cancelled() => return,
                    permit = self.demand.acquire() => match permit {
                        Ok(permit) => break permit,
                        Err(_) => return,
                    },
                    mutation = next_mutation(&mut mutations) => {
                        if mutation.is_none() {
                            mutations = None;
                        }
                    }
                }
            };
            // Notifications already queued are covered by the recompute below.
            if let Some(stream) = mutations.as_mut() {
                while let Some(Some(_)) = stream.next().now_or_never() {}
            }
            dirty = false;

            let change = match self.store.fetch(&self.query, usize::MAX, 0).await {
                Ok(records) => {
                    let script = diff(&snapshot, &records);
                    if script.is_empty() && !first {
                        trace!(source = %self.query.source, "suppressed empty diff");
                        drop(permit);
                        continue;
                    }
                    first = false;
                    snapshot = records;
                    LoadState::Loaded(script)
                }
                Err(err) => LoadState::Failure(err),
            };

            if self.token.is_cancelled() {
                return;
            }
            permit.forget();
            if self.sender.send(change).is_err() {
                return;
            }
        }
    }
}

async fn next_mutation(mutations: &mut Option<MutationStream>) -> Option<()> {
    match mutations.as_mut() {
        Some(stream) => stream.next().await.map(|_| ()),
        None => std::future::pending().await,
    }
}
