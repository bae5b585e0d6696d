use std::sync::Arc;

use futures::future::{BoxFuture, OptionFuture};
use futures::stream::BoxStream;
use futures::{FutureExt, Stream, StreamExt};
use serde::Serialize;
use tokio::sync::{mpsc, watch};
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, trace};

use crate::domain::Record;
use crate::error::SyncError;
use crate::query::{LoadState, Query, section_label};
use crate::store::RecordStore;

pub const DEFAULT_PAGE_SIZE: usize = 100;
const EMISSION_BUFFER: usize = 16;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum ListItem {
    Header(String),
    Record(Record),
}

impl ListItem {
    pub fn record(&self) -> Option<&Record> {
        match self {
            ListItem::Record(record) => Some(record),
            ListItem::Header(_) => None,
        }
    }
}

pub type PageStream = BoxStream<'static, LoadState<Vec<ListItem>>>;

/// Consumer-driven pagination over a [`RecordStore`] with section headers.
#[derive(Clone)]
pub struct PageEngine {
    store: Arc<dyn RecordStore>,
    page_size: usize,
}

impl PageEngine {
    pub fn new(store: Arc<dyn RecordStore>) -> Self {
        Self {
            store,
            page_size: DEFAULT_PAGE_SIZE,
        }
    }

    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    /// Emits the cumulative item list after every page. Page 0 loads right
    /// away; each `load_more` signal loads the next page while the last one
    /// was full. A `reload` signal re-reads `query`, emits `Loading` and starts
    /// over at page 0. Store writes to the active source re-emit the loaded
    /// range. The stream ends once both signal streams have ended and nothing
    /// is pending.
    pub fn pages<R, L>(&self, query: watch::Receiver<Query>, reload: R, load_more: L) -> PageStream
    where
        R: Stream<Item = ()> + Send + 'static,
        L: Stream<Item = ()> + Send + 'static,
    {
        let (sender, receiver) = mpsc::channel(EMISSION_BUFFER);
        let pager = Pager::new(self.store.clone(), self.page_size, query);
        tokio::spawn(pager.run(reload.boxed(), load_more.boxed(), sender));
        ReceiverStream::new(receiver).boxed()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Request {
    Page(usize),
    /// Re-reads the first `pages` pages after a store write.
    Rematerialize { pages: usize },
}

type PendingFetch = BoxFuture<'static, (Request, Result<Vec<Record>, SyncError>)>;

struct Pager {
    store: Arc<dyn RecordStore>,
    page_size: usize,
    query_rx: watch::Receiver<Query>,
    query: Query,
    items: Vec<ListItem>,
    last_header: Option<String>,
    pages_loaded: usize,
    exhausted: bool,
}

impl Pager {
    fn new(store: Arc<dyn RecordStore>, page_size: usize, query_rx: watch::Receiver<Query>) -> Self {
        let query = query_rx.borrow().clone();
        Self {
            store,
            page_size,
            query_rx,
            query,
            items: Vec::new(),
            last_header: None,
            pages_loaded: 0,
            exhausted: false,
        }
    }

    async fn run(
        mut self,
        mut reload: BoxStream<'static, ()>,
        mut load_more: BoxStream<'static, ()>,
        sender: mpsc::Sender<LoadState<Vec<ListItem>>>,
    ) {
        let mut mutations = self.store.subscribe(&self.query.source);
        let mut pending: Option<PendingFetch> = Some(self.fetch(Request::Page(0)));
        let mut reload_open = true;
        let mut load_more_open = true;
        let mut more_requested = false;
        let mut stale = false;

        if sender.send(LoadState::Loading).await.is_err() {
            return;
        }

        loop {
            if !reload_open && !load_more_open && pending.is_none() {
                debug!(source = %self.query.source, "page signals closed");
                return;
            }

            tokio::select! {
                biased;
                _ = sender.closed() => return,
                signal = reload.next(), if reload_open => match signal {
                    Some(()) => {
                        let previous = self.query.source.clone();
                        self.restart();
                        if self.query.source != previous {
                            mutations = self.store.subscribe(&self.query.source);
                        }
                        more_requested = false;
                        stale = false;
                        pending = Some(self.fetch(Request::Page(0)));
                        if sender.send(LoadState::Loading).await.is_err() {
                            return;
                        }
                    }
                    None => reload_open = false,
                },
                Some((request, result)) = OptionFuture::from(pending.as_mut()), if pending.is_some() => {
                    pending = None;
                    let state = match result {
                        Ok(records) => {
                            self.apply(request, records);
                            LoadState::Loaded(self.items.clone())
                        }
                        Err(err) => LoadState::Failure(err),
                    };
                    if sender.send(state).await.is_err() {
                        return;
                    }
                    if stale {
                        stale = false;
                        pending = self.rematerialize();
                    } else if more_requested {
                        more_requested = false;
                        pending = self.next_page();
                    }
                },
                signal = load_more.next(), if load_more_open => match signal {
                    Some(()) if pending.is_some() => more_requested = true,
                    Some(()) => pending = self.next_page(),
                    None => load_more_open = false,
                },
                Some(_) = mutations.next() => {
                    trace!(source = %self.query.source, "store changed under open pages");
                    if pending.is_some() {
                        stale = true;
                    } else {
                        pending = self.rematerialize();
                    }
                },
            }
        }
    }

    fn restart(&mut self) {
        self.query = self.query_rx.borrow_and_update().clone();
        self.items.clear();
        self.last_header = None;
        self.pages_loaded = 0;
        self.exhausted = false;
    }

    fn next_page(&self) -> Option<PendingFetch> {
        if self.exhausted {
            trace!(source = %self.query.source, "no further pages");
            return None;
        }
        Some(self.fetch(Request::Page(self.pages_loaded)))
    }

    fn rematerialize(&self) -> Option<PendingFetch> {
        (self.pages_loaded > 0).then(|| {
            self.fetch(Request::Rematerialize {
                pages: self.pages_loaded,
            })
        })
    }

    fn fetch(&self, request: Request) -> PendingFetch {
        let store = self.store.clone();
        let query = self.query.clone();
        let (limit, offset) = match request {
            Request::Page(page) => (self.page_size, page * self.page_size),
            Request::Rematerialize { pages } => (pages * self.page_size, 0),
        };
        async move { (request, store.fetch(&query, limit, offset).await) }.boxed()
    }

    fn apply(&mut self, request: Request, records: Vec<Record>) {
        match request {
            Request::Page(page) => {
                self.exhausted = records.len() < self.page_size;
                self.pages_loaded = page + 1;
                self.append(records);
            }
            Request::Rematerialize { pages } => {
                self.exhausted = records.len() < pages * self.page_size;
                self.items.clear();
                self.last_header = None;
                self.append(records);
            }
        }
    }

    fn append(&mut self, records: Vec<Record>) {
        let section = self.query.section_field().map(str::to_string);
        for record in records {
            if let Some(field) = &section {
                let label = section_label(record.field(field));
                if self.last_header.as_deref() != Some(label.as_str()) {
                    self.items.push(ListItem::Header(label.clone()));
                    self.last_header = Some(label);
                }
            }
            self.items.push(ListItem::Record(record));
        }
    }
}
