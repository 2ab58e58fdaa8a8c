use std::sync::Arc;

use serde_json::Value;

use super::{LeafRequest, Record, RequestNode};
use crate::Service;
use crate::error::{Error, Result};
use crate::http::HttpRequest;

const MULTICALL: &str = "system.multicall";

/// One logical remote call inside a batch.
#[derive(Debug, Clone, PartialEq)]
pub struct RpcCall {
    pub method: String,
    pub params: Vec<Value>,
}

impl RpcCall {
    pub fn new(method: impl Into<String>, params: Vec<Value>) -> Self {
        Self {
            method: method.into(),
            params,
        }
    }
}

pub type ItemParser = Arc<dyn Fn(usize, Value) -> Result<Record> + Send + Sync>;

pub type ChunkParser = Arc<dyn Fn(Vec<Result<Value>>) -> Result<Record> + Send + Sync>;

/// Arguments of the `system.multicall` call for `calls`.
fn entries(service: &Service, calls: &[RpcCall]) -> Result<Vec<Value>> {
    let entries = calls
        .iter()
        .map(|call| service.protocol().multicall_entry(&call.method, call.params.clone()))
        .collect::<Result<Vec<Value>>>()?;
    Ok(service.protocol().multicall_params(entries))
}

fn check_count(expected: usize, got: usize) -> Result<()> {
    if expected != got {
        return Err(Error::parsing(format!(
            "multicall returned {} results for {} calls",
            got, expected
        )));
    }
    Ok(())
}

/// N calls collapsed into a single `system.multicall`.
///
/// A faulted call only fails its own slot, when that slot is consumed.
pub struct Multicall {
    leaf: LeafRequest,
    calls: Vec<RpcCall>,
    parser: ItemParser,
}

impl Multicall {
    pub fn new<F>(calls: Vec<RpcCall>, parser: F) -> Self
    where
        F: Fn(usize, Value) -> Result<Record> + Send + Sync + 'static,
    {
        Self {
            leaf: LeafRequest::rpc(MULTICALL),
            calls,
            parser: Arc::new(parser),
        }
    }

    /// Same method for every params entry.
    pub fn repeat<F>(method: &str, params: Vec<Vec<Value>>, parser: F) -> Self
    where
        F: Fn(usize, Value) -> Result<Record> + Send + Sync + 'static,
    {
        let calls = params.into_iter().map(|p| RpcCall::new(method, p)).collect();
        Self::new(calls, parser)
    }

    pub fn option(mut self, option: impl Into<String>) -> Self {
        self.leaf.push_option(option);
        self
    }

    pub fn on_error(mut self, hook: super::ErrorHook) -> Self {
        self.leaf = self.leaf.on_error(hook);
        self
    }

    pub fn calls(&self) -> &[RpcCall] {
        &self.calls
    }

    pub(crate) fn leaf_mut(&mut self) -> &mut LeafRequest {
        &mut self.leaf
    }
}

impl RequestNode for Multicall {
    type Input = Vec<Result<Value>>;
    type Output = Vec<Result<Record>>;

    fn options(&self) -> Vec<String> {
        self.leaf.options()
    }

    fn finalize(&mut self, service: &Service) -> Result<()> {
        if self.leaf.is_finalized() {
            return Ok(());
        }
        let entries = entries(service, &self.calls)?;
        self.leaf.set_args(entries);
        self.leaf.finalize(service)
    }

    fn prepare(&mut self, service: &Service) -> Result<Vec<HttpRequest>> {
        self.finalize(service)?;
        Ok(vec![self.leaf.prepared()?.clone()])
    }

    fn parse(&self, items: Vec<Result<Value>>) -> Result<Vec<Result<Record>>> {
        check_count(self.calls.len(), items.len())?;
        Ok(items
            .into_iter()
            .enumerate()
            .map(|(index, item)| item.and_then(|value| (self.parser)(index, value)))
            .collect())
    }

    fn handle_exception(&self, err: Error) -> Error {
        self.leaf.handle_exception(err)
    }
}

/// Calls contributed by one logical request to a merged batch.
pub struct MulticallPart {
    calls: Vec<RpcCall>,
    parser: ChunkParser,
}

impl MulticallPart {
    pub fn new<F>(calls: Vec<RpcCall>, parser: F) -> Self
    where
        F: Fn(Vec<Result<Value>>) -> Result<Record> + Send + Sync + 'static,
    {
        Self {
            calls,
            parser: Arc::new(parser),
        }
    }

    /// A part that contributes nothing and yields `Record::Null`.
    pub fn empty() -> Self {
        Self::new(Vec::new(), |_| Ok(Record::Null))
    }

    pub fn len(&self) -> usize {
        self.calls.len()
    }

    pub fn is_empty(&self) -> bool {
        self.calls.is_empty()
    }
}

/// Independently built requests sharing one `system.multicall`.
///
/// Each part gets back exactly the slice of results its calls produced;
/// empty parts yield `Record::Null` without consuming any results.
pub struct MergedMulticall {
    leaf: LeafRequest,
    parts: Vec<MulticallPart>,
}

impl MergedMulticall {
    pub fn new(parts: Vec<MulticallPart>) -> Self {
        Self {
            leaf: LeafRequest::rpc(MULTICALL),
            parts,
        }
    }

    pub fn option(mut self, option: impl Into<String>) -> Self {
        self.leaf.push_option(option);
        self
    }

    pub fn on_error(mut self, hook: super::ErrorHook) -> Self {
        self.leaf = self.leaf.on_error(hook);
        self
    }

    pub fn lengths(&self) -> Vec<usize> {
        self.parts.iter().map(MulticallPart::len).collect()
    }

    pub(crate) fn leaf_mut(&mut self) -> &mut LeafRequest {
        &mut self.leaf
    }
}

impl RequestNode for MergedMulticall {
    type Input = Vec<Result<Value>>;
    type Output = Vec<Result<Record>>;

    fn options(&self) -> Vec<String> {
        self.leaf.options()
    }

    fn finalize(&mut self, service: &Service) -> Result<()> {
        if self.leaf.is_finalized() {
            return Ok(());
        }
        let calls: Vec<RpcCall> = self.parts.iter().flat_map(|p| p.calls.clone()).collect();
        let entries = entries(service, &calls)?;
        self.leaf.set_args(entries);
        self.leaf.finalize(service)
    }

    fn prepare(&mut self, service: &Service) -> Result<Vec<HttpRequest>> {
        self.finalize(service)?;
        Ok(vec![self.leaf.prepared()?.clone()])
    }

    fn parse(&self, items: Vec<Result<Value>>) -> Result<Vec<Result<Record>>> {
        check_count(self.lengths().iter().sum(), items.len())?;
        let mut items = items.into_iter();
        Ok(self
            .parts
            .iter()
            .map(|part| {
                if part.is_empty() {
                    return Ok(Record::Null);
                }
                let chunk: Vec<Result<Value>> = items.by_ref().take(part.len()).collect();
                (part.parser)(chunk)
            })
            .collect())
    }

    fn handle_exception(&self, err: Error) -> Error {
        self.leaf.handle_exception(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn values(chunk: Vec<Result<Value>>) -> Result<Record> {
        let values = chunk.into_iter().collect::<Result<Vec<Value>>>()?;
        Ok(Record::List(values.into_iter().map(Record::Value).collect()))
    }

    #[test]
    fn test_merged_multicall_preserves_shape() {
        // Given: 寄与数が [0, 2, 1] のパート
        let merged = MergedMulticall::new(vec![
            MulticallPart::empty(),
            MulticallPart::new(
                vec![RpcCall::new("ticket.get", vec![json!(1)]), RpcCall::new("ticket.get", vec![json!(2)])],
                values,
            ),
            MulticallPart::new(vec![RpcCall::new("ticket.changeLog", vec![json!(1)])], values),
        ]);
        assert_eq!(merged.lengths(), vec![0, 2, 1]);

        // When: 3件のワイヤ結果を解析
        let results = merged
            .parse(vec![Ok(json!("a")), Ok(json!("b")), Ok(json!("c"))])
            .unwrap();

        // Then: [None, 2件, 1件] の形になる
        assert_eq!(results.len(), 3);
        assert_eq!(results[0].as_ref().unwrap(), &Record::Null);
        assert_eq!(
            results[1].as_ref().unwrap(),
            &Record::List(vec![Record::Value(json!("a")), Record::Value(json!("b"))])
        );
        assert_eq!(
            results[2].as_ref().unwrap(),
            &Record::List(vec![Record::Value(json!("c"))])
        );
    }

    #[test]
    fn test_merged_multicall_fault_stays_in_its_part() {
        let merged = MergedMulticall::new(vec![
            MulticallPart::new(vec![RpcCall::new("a", vec![])], values),
            MulticallPart::new(vec![RpcCall::new("b", vec![])], values),
        ]);

        let results = merged
            .parse(vec![
                Err(Error::MulticallFault {
                    index: 0,
                    source: Box::new(Error::request("boom")),
                }),
                Ok(json!("ok")),
            ])
            .unwrap();

        assert!(results[0].is_err());
        assert_eq!(
            results[1].as_ref().unwrap(),
            &Record::List(vec![Record::Value(json!("ok"))])
        );
    }

    #[test]
    fn test_count_mismatch_is_a_parsing_error() {
        let call = Multicall::repeat("ticket.get", vec![vec![json!(1)], vec![json!(2)]], |_, v| {
            Ok(Record::Value(v))
        });
        assert!(matches!(call.parse(vec![Ok(json!(1))]), Err(Error::Parsing { .. })));
    }

    #[test]
    fn test_multicall_faults_are_per_item() {
        let call = Multicall::repeat("ticket.get", vec![vec![json!(1)], vec![json!(2)]], |_, v| {
            Ok(Record::Value(v))
        });

        let results = call
            .parse(vec![
                Ok(json!("first")),
                Err(Error::MulticallFault {
                    index: 1,
                    source: Box::new(Error::request("no such ticket")),
                }),
            ])
            .unwrap();

        assert_eq!(results[0].as_ref().unwrap(), &Record::Value(json!("first")));
        assert!(matches!(results[1], Err(Error::MulticallFault { index: 1, .. })));
    }
}
