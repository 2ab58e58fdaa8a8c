//! Deferred request trees.
//!
//! A [`Request`] is either a leaf wrapping one physical call, a paged leaf,
//! a multicall batch, a composite over child requests, or a null
//! placeholder. Nothing touches the network until the tree is handed to
//! [`Service::send`](crate::Service::send).

pub mod composite;
pub mod leaf;
pub mod multicall;
pub mod paging;

pub use composite::{CompositeRequest, Composer, NullRequest};
pub use leaf::{Encoding, LeafRequest};
pub use multicall::{MergedMulticall, Multicall, MulticallPart, RpcCall};
pub use paging::{LinkSource, PageState, PagedRequest, Paging, TotalSource};

use std::fmt::Write as _;
use std::sync::Arc;

use futures::StreamExt;
use futures::TryStreamExt;
use futures::stream::BoxStream;
use serde_json::Value;

use crate::Service;
use crate::error::{Error, Result};
use crate::http::{HttpRequest, Reply};
use crate::models::{Attachment, Change, Comment, Item};

pub type Params = serde_json::Map<String, Value>;

pub type ResultStream = BoxStream<'static, Result<Record>>;

pub type Parser = Arc<dyn Fn(Reply) -> Result<Vec<Record>> + Send + Sync>;

pub type ErrorHook = Arc<dyn Fn(Error) -> Error + Send + Sync>;

/// One parsed result.
#[derive(Debug, Clone, PartialEq)]
pub enum Record {
    Item(Box<Item>),
    Comment(Comment),
    Attachment(Attachment),
    Change(Change),
    Value(Value),
    List(Vec<Record>),
    Null,
}

impl Record {
    pub fn is_null(&self) -> bool {
        matches!(self, Record::Null)
    }

    pub fn into_item(self) -> Option<Item> {
        match self {
            Record::Item(item) => Some(*item),
            _ => None,
        }
    }

    pub fn into_value(self) -> Option<Value> {
        match self {
            Record::Value(value) => Some(value),
            _ => None,
        }
    }

    pub fn into_list(self) -> Vec<Record> {
        match self {
            Record::List(records) => records,
            Record::Null => Vec::new(),
            other => vec![other],
        }
    }
}

impl From<Item> for Record {
    fn from(item: Item) -> Self {
        Record::Item(Box::new(item))
    }
}

/// What [`Service::send`](crate::Service::send) hands back.
pub enum Output {
    Value(Record),
    Stream(ResultStream),
}

impl Output {
    pub fn into_stream(self) -> ResultStream {
        match self {
            Output::Value(record) => futures::stream::once(async move { Ok(record) }).boxed(),
            Output::Stream(stream) => stream,
        }
    }

    pub async fn collect(self) -> Result<Vec<Record>> {
        match self {
            Output::Value(record) => Ok(vec![record]),
            Output::Stream(stream) => stream.try_collect().await,
        }
    }

    pub async fn items(self) -> Result<Vec<Item>> {
        Ok(self
            .collect()
            .await?
            .into_iter()
            .filter_map(Record::into_item)
            .collect())
    }
}

impl std::fmt::Debug for Output {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Output::Value(record) => f.debug_tuple("Value").field(record).finish(),
            Output::Stream(_) => f.write_str("Stream(..)"),
        }
    }
}

/// Shared contract of every request kind.
pub trait RequestNode {
    type Input;
    type Output;

    /// Human readable description lines, used for dry runs.
    fn options(&self) -> Vec<String>;

    /// Injects auth and encodes params. Idempotent until reset.
    fn finalize(&mut self, service: &Service) -> Result<()>;

    /// Finalized physical requests in this subtree, depth first.
    fn prepare(&mut self, service: &Service) -> Result<Vec<HttpRequest>>;

    fn parse(&self, input: Self::Input) -> Result<Self::Output>;

    fn handle_exception(&self, err: Error) -> Error {
        err
    }
}

pub enum Request {
    Leaf(LeafRequest),
    Paged(PagedRequest),
    Multicall(Multicall),
    Merged(MergedMulticall),
    Composite(CompositeRequest),
    Null(NullRequest),
}

impl Request {
    pub fn options(&self) -> Vec<String> {
        match self {
            Request::Leaf(r) => r.options(),
            Request::Paged(r) => r.options(),
            Request::Multicall(r) => r.options(),
            Request::Merged(r) => r.options(),
            Request::Composite(r) => r.options(),
            Request::Null(r) => r.options(),
        }
    }

    pub fn finalize(&mut self, service: &Service) -> Result<()> {
        match self {
            Request::Leaf(r) => r.finalize(service),
            Request::Paged(r) => r.finalize(service),
            Request::Multicall(r) => r.finalize(service),
            Request::Merged(r) => r.finalize(service),
            Request::Composite(r) => r.finalize(service),
            Request::Null(r) => r.finalize(service),
        }
    }

    pub fn prepare(&mut self, service: &Service) -> Result<Vec<HttpRequest>> {
        match self {
            Request::Leaf(r) => r.prepare(service),
            Request::Paged(r) => r.prepare(service),
            Request::Multicall(r) => r.prepare(service),
            Request::Merged(r) => r.prepare(service),
            Request::Composite(r) => r.prepare(service),
            Request::Null(r) => r.prepare(service),
        }
    }

    pub fn handle_exception(&self, err: Error) -> Error {
        match self {
            Request::Leaf(r) => r.handle_exception(err),
            Request::Paged(r) => r.handle_exception(err),
            Request::Multicall(r) => r.handle_exception(err),
            Request::Merged(r) => r.handle_exception(err),
            Request::Composite(r) => r.handle_exception(err),
            Request::Null(r) => r.handle_exception(err),
        }
    }

    /// Whether sending yields a stream instead of a single value.
    pub fn yields_many(&self) -> bool {
        match self {
            Request::Leaf(r) => r.yields_many(),
            Request::Composite(r) => r.yields_many(),
            Request::Paged(_) | Request::Multicall(_) | Request::Merged(_) => true,
            Request::Null(_) => false,
        }
    }

    /// Dry-run rendering: options followed by every prepared request.
    pub fn describe(&mut self, service: &Service) -> Result<String> {
        let width = service.constants().columns.min(80);
        let mut out = String::new();
        for option in self.options() {
            let _ = writeln!(out, " * {}", option);
        }
        for request in self.prepare(service)? {
            let _ = writeln!(out, "{}", "-".repeat(width));
            let _ = writeln!(out, "{} {}", request.method.as_str(), request.url);
            for (name, value) in &request.headers {
                let _ = writeln!(out, "{}: {}", name, value);
            }
            if let Some(body) = &request.body {
                let _ = writeln!(out, "\n{}", body);
            }
        }
        Ok(out)
    }
}

impl From<LeafRequest> for Request {
    fn from(r: LeafRequest) -> Self {
        Request::Leaf(r)
    }
}

impl From<PagedRequest> for Request {
    fn from(r: PagedRequest) -> Self {
        Request::Paged(r)
    }
}

impl From<Multicall> for Request {
    fn from(r: Multicall) -> Self {
        Request::Multicall(r)
    }
}

impl From<MergedMulticall> for Request {
    fn from(r: MergedMulticall) -> Self {
        Request::Merged(r)
    }
}

impl From<CompositeRequest> for Request {
    fn from(r: CompositeRequest) -> Self {
        Request::Composite(r)
    }
}

impl From<NullRequest> for Request {
    fn from(r: NullRequest) -> Self {
        Request::Null(r)
    }
}

/// Rejects requests that need IDs before anything is sent.
pub fn require_ids(ids: &[u64]) -> Result<()> {
    if ids.is_empty() {
        return Err(Error::Usage("no item ID(s) specified".to_string()));
    }
    Ok(())
}

/// Maps not-found failures onto a nonexistent item error for `ids`.
pub fn nonexistent_hook(ids: &[u64]) -> ErrorHook {
    let ids = ids.to_vec();
    Arc::new(move |err| {
        if err.is_not_found() && !matches!(err, Error::NonexistentItem { .. }) {
            Error::NonexistentItem { ids: ids.clone() }
        } else {
            err
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_require_ids() {
        assert!(matches!(require_ids(&[]), Err(Error::Usage(_))));
        assert!(require_ids(&[1]).is_ok());
    }

    #[test]
    fn test_nonexistent_hook_translates_404_only() {
        let hook = nonexistent_hook(&[12]);

        let err = hook(Error::Request {
            msg: "HTTP Error 404: Not Found".to_string(),
            code: Some(404),
            text: None,
        });
        assert!(matches!(err, Error::NonexistentItem { ref ids } if ids == &vec![12]));

        let err = hook(Error::request("HTTP Error 500: boom"));
        assert!(matches!(err, Error::Request { .. }));
    }

    #[test]
    fn test_record_into_list() {
        assert_eq!(Record::Null.into_list(), Vec::<Record>::new());
        assert_eq!(
            Record::Value(Value::from(1)).into_list(),
            vec![Record::Value(Value::from(1))]
        );
    }

    #[test]
    fn test_output_value_is_a_one_record_stream() {
        let output = Output::Value(Record::Value(Value::from("5.0")));
        let records = tokio_test::block_on(output.collect()).unwrap();
        assert_eq!(records, vec![Record::Value(Value::from("5.0"))]);

        let stream = Output::Value(Record::Null).into_stream();
        let records: Vec<Record> = tokio_test::block_on(stream.try_collect()).unwrap();
        assert_eq!(records, vec![Record::Null]);
    }
}
