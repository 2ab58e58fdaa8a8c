//! Request dispatching.
//!
//! The only place work is spawned. Every leaf and paged request becomes a
//! task on the runtime as soon as the tree is dispatched; the semaphore in
//! the session bounds how many of them talk to the server at once.
//! Results are handed back as streams in construction order, whatever
//! order the tasks finish in.

use futures::{StreamExt, TryStreamExt, stream};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::Service;
use crate::error::{Error, Result};
use crate::request::{
    LeafRequest, Output, PagedRequest, Record, Request, RequestNode, ResultStream,
};

const PAGE_BUFFER: usize = 256;

type Batch = Result<Vec<Result<Record>>>;

impl Service {
    /// Sends one request tree.
    ///
    /// Requests are finalized before anything is spawned so usage errors
    /// surface without network activity. Single-value requests resolve to
    /// [`Output::Value`]; everything else is a lazy [`Output::Stream`].
    pub async fn send(&self, request: impl Into<Request>) -> Result<Output> {
        let mut request = request.into();
        request.finalize(self)?;

        let many = request.yields_many();
        let mut results = self.dispatch(request);
        if many {
            return Ok(Output::Stream(results));
        }
        match results.next().await {
            Some(result) => result.map(Output::Value),
            None => Ok(Output::Value(Record::Null)),
        }
    }

    /// Sends several independent requests concurrently, yielding their
    /// results in the order given.
    pub async fn send_all(&self, requests: Vec<Request>) -> Result<ResultStream> {
        let mut requests = requests;
        for request in &mut requests {
            request.finalize(self)?;
        }
        let streams: Vec<ResultStream> = requests.into_iter().map(|r| self.dispatch(r)).collect();
        Ok(stream::iter(streams).flatten().boxed())
    }

    pub(crate) fn dispatch(&self, request: Request) -> ResultStream {
        match request {
            Request::Leaf(leaf) => {
                let service = self.clone();
                deferred(tokio::spawn(async move { service.run_leaf(leaf).await }))
            }
            Request::Paged(paged) => {
                let (tx, rx) = mpsc::channel(PAGE_BUFFER);
                let service = self.clone();
                tokio::spawn(async move { service.run_paged(paged, tx).await });
                receiver(rx)
            }
            Request::Multicall(mut call) => {
                let service = self.clone();
                deferred(tokio::spawn(async move {
                    let outcome = async {
                        call.finalize(&service)?;
                        service.run_batch(call.leaf_mut()).await
                    }
                    .await;
                    match outcome {
                        Ok(items) => call.parse(items),
                        Err(err) => Err(call.handle_exception(err)),
                    }
                }))
            }
            Request::Merged(mut merged) => {
                let service = self.clone();
                deferred(tokio::spawn(async move {
                    let outcome = async {
                        merged.finalize(&service)?;
                        service.run_batch(merged.leaf_mut()).await
                    }
                    .await;
                    match outcome {
                        Ok(items) => merged.parse(items),
                        Err(err) => Err(merged.handle_exception(err)),
                    }
                }))
            }
            Request::Composite(mut composite) => {
                let streams = composite
                    .take_children()
                    .into_iter()
                    .map(|child| self.dispatch(child))
                    .collect();
                match composite.parse((self.clone(), streams)) {
                    Ok(results) => results
                        .map_err(move |err| composite.handle_exception(err))
                        .boxed(),
                    Err(err) => failed(err),
                }
            }
            Request::Null(null) => null.parse(()).unwrap_or_else(failed),
        }
    }

    async fn run_leaf(&self, mut leaf: LeafRequest) -> Batch {
        let outcome = async {
            leaf.finalize(self)?;
            let reply = self.execute(leaf.prepared()?).await?;
            leaf.parse(reply)
        }
        .await;
        match outcome {
            Ok(records) => Ok(records.into_iter().map(Ok).collect()),
            Err(err) => Err(leaf.handle_exception(err)),
        }
    }

    async fn run_batch(&self, leaf: &mut LeafRequest) -> Result<Vec<Result<Value>>> {
        leaf.finalize(self)?;
        let reply = self.execute(leaf.prepared()?).await?;
        self.protocol().split_multicall(reply.data, self.tracker())
    }

    /// Pages of one request are fetched strictly one after another; the
    /// bounded channel keeps the producer from running ahead of the
    /// consumer.
    async fn run_paged(&self, mut paged: PagedRequest, tx: mpsc::Sender<Result<Record>>) {
        loop {
            let (records, more) = match self.fetch_page(&mut paged).await {
                Ok(page) => page,
                Err(err) => {
                    let _ = tx.send(Err(paged.handle_exception(err))).await;
                    return;
                }
            };
            for record in records {
                if tx.send(Ok(record)).await.is_err() {
                    debug!("paged results dropped by consumer");
                    return;
                }
            }
            if !more {
                debug!(seen = paged.seen(), "paging exhausted");
                return;
            }
        }
    }

    async fn fetch_page(&self, paged: &mut PagedRequest) -> Result<(Vec<Record>, bool)> {
        paged.finalize(self)?;
        let reply = self.execute(paged.prepared()?).await?;
        paged.next_page(reply)
    }
}

fn deferred(handle: JoinHandle<Batch>) -> ResultStream {
    stream::once(async move {
        let results = match handle.await {
            Ok(Ok(results)) => results,
            Ok(Err(err)) => vec![Err(err)],
            Err(err) => vec![Err(Error::Unexpected(format!("worker task failed: {}", err)))],
        };
        stream::iter(results)
    })
    .flatten()
    .boxed()
}

fn receiver(rx: mpsc::Receiver<Result<Record>>) -> ResultStream {
    stream::unfold(rx, |mut rx| async move { rx.recv().await.map(|item| (item, rx)) }).boxed()
}

fn failed(err: Error) -> ResultStream {
    stream::once(async move { Err(err) }).boxed()
}
