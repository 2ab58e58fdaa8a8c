use std::collections::BTreeMap;
use std::sync::Arc;

use futures::{StreamExt, TryStreamExt, stream};
use serde_json::Value;

use super::{require_terms, search_options};
use crate::config::ServiceConfig;
use crate::error::{Error, Result};
use crate::models::{
    Attachment, Change, Comment, FieldChange, GetOptions, Item, SearchQuery, parse_time, string,
    with_description,
};
use crate::protocol::ProtocolKind;
use crate::request::{
    CompositeRequest, ErrorHook, LeafRequest, MergedMulticall, MulticallPart, Record, Request,
    RpcCall, nonexistent_hook,
};
use crate::service::{Service, ServiceKind, Tracker};

/// Trac's XML/JSON-RPC plugin, mounted at `<base>/rpc`. The plugin picks
/// the protocol from the request's content type.
///
/// Ticket, change log and attachment calls for all requested IDs share one
/// `system.multicall`.
#[derive(Debug, Clone)]
pub struct Trac {
    base: String,
    api: String,
    protocol: ProtocolKind,
}

impl Trac {
    pub fn new(config: &ServiceConfig) -> Self {
        Self::with_protocol(config, ProtocolKind::JsonRpc)
    }

    pub fn xmlrpc(config: &ServiceConfig) -> Self {
        Self::with_protocol(config, ProtocolKind::XmlRpc)
    }

    fn with_protocol(config: &ServiceConfig, protocol: ProtocolKind) -> Self {
        Self {
            base: config.base.clone(),
            api: format!("{}/rpc", config.base),
            protocol,
        }
    }

    fn calls(method: &str, ids: &[u64]) -> Vec<RpcCall> {
        ids.iter().map(|id| RpcCall::new(method, vec![Value::from(*id)])).collect()
    }

    /// Ticket, change log and attachment calls in that order, one
    /// single-call part per ID so a fault only touches its own ticket.
    fn batch(&self, ids: &[u64], options: GetOptions) -> MergedMulticall {
        let mut parts: Vec<MulticallPart> = ids
            .iter()
            .map(|&id| {
                let this = self.clone();
                MulticallPart::new(Self::calls("ticket.get", &[id]), move |results| {
                    Ok(Record::from(this.ticket(&single(results)?)?))
                })
            })
            .collect();

        // comments and changes both come out of the change log
        parts.extend(ids.iter().map(|&id| {
            if options.comments || options.changes {
                MulticallPart::new(Self::calls("ticket.changeLog", &[id]), |results| {
                    Ok(Record::Value(single(results)?))
                })
            } else {
                MulticallPart::empty()
            }
        }));

        parts.extend(ids.iter().map(|&id| {
            if options.attachments {
                MulticallPart::new(Self::calls("ticket.listAttachments", &[id]), |results| {
                    Ok(Record::List(attachments(&single(results)?)))
                })
            } else {
                MulticallPart::empty()
            }
        }));

        MergedMulticall::new(parts)
    }

    /// `[id, created, modified, {attributes}]`
    fn ticket(&self, value: &Value) -> Result<Item> {
        let fields = value
            .as_array()
            .filter(|v| v.len() >= 4)
            .ok_or_else(|| Error::parsing("unexpected ticket.get result"))?;
        let attrs = &fields[3];
        let mut item = Item::new(fields[0].as_u64().unwrap_or_default());
        item.created = parse_time(&fields[1]);
        item.modified = parse_time(&fields[2]);
        item.title = string(attrs, "summary");
        item.creator = string(attrs, "reporter");
        item.owner = string(attrs, "owner").filter(|s| !s.is_empty());
        item.status = string(attrs, "status");
        item.description = string(attrs, "description").filter(|s| !s.is_empty());
        item.cc = string(attrs, "cc")
            .unwrap_or_default()
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect();
        item.url = Some(format!("{}/ticket/{}", self.base, item.id));
        for key in ["type", "priority", "milestone", "component", "resolution", "keywords"] {
            if let Some(value) = attrs.get(key).filter(|v| v.as_str().is_some_and(|s| !s.is_empty())) {
                item.fields.insert(key.to_string(), value.clone());
            }
        }
        Ok(item)
    }
}

/// Splits a change log into comments and field changes.
///
/// Entries are `[time, author, field, old, new, permanent]`; entries sharing
/// time and author belong to one change, and a `comment` entry's old value
/// is the comment number.
fn changelog(log: &Value) -> (Vec<Comment>, Vec<Change>) {
    let mut comments = Vec::new();
    let mut changes: Vec<Change> = Vec::new();
    let mut last: Option<(String, Option<String>)> = None;

    for entry in log.as_array().into_iter().flatten() {
        let Some(entry) = entry.as_array().filter(|e| e.len() >= 5) else {
            continue;
        };
        let created = parse_time(&entry[0]);
        let author = entry[1].as_str().map(str::to_string);
        let field = entry[2].as_str().unwrap_or_default();
        let old = entry[3].as_str().unwrap_or_default();
        let new = entry[4].as_str().unwrap_or_default();

        if field == "comment" {
            if !new.is_empty() {
                comments.push(Comment {
                    id: None,
                    // replies are numbered "3.5"; the last component is the number
                    count: old.rsplit('.').next().and_then(|n| n.parse().ok()).unwrap_or_default(),
                    creator: author,
                    created,
                    text: new.to_string(),
                });
            }
            continue;
        }

        let key = (entry[0].to_string(), author.clone());
        if last.as_ref() != Some(&key) {
            changes.push(Change {
                id: None,
                count: changes.len() as u64 + 1,
                creator: author,
                created,
                changes: BTreeMap::new(),
            });
            last = Some(key);
        }
        if let Some(change) = changes.last_mut() {
            change.changes.insert(
                field.to_string(),
                FieldChange {
                    removed: Some(old.to_string()).filter(|s| !s.is_empty()),
                    added: Some(new.to_string()).filter(|s| !s.is_empty()),
                },
            );
        }
    }
    (comments, changes)
}

/// `[[filename, description, size, time, author], ...]`
fn attachments(list: &Value) -> Vec<Record> {
    list.as_array()
        .into_iter()
        .flatten()
        .filter_map(Value::as_array)
        .filter(|a| a.len() >= 5)
        .map(|a| {
            let mut attachment = Attachment::new(None, a[0].as_str().unwrap_or_default());
            attachment.size = a[2].as_u64();
            attachment.created = parse_time(&a[3]);
            attachment.creator = a[4].as_str().map(str::to_string);
            Record::Attachment(attachment)
        })
        .collect()
}

/// The only result of a one-call part.
fn single(results: Vec<Result<Value>>) -> Result<Value> {
    results
        .into_iter()
        .next()
        .unwrap_or_else(|| Err(Error::parsing("empty multicall part")))
}

/// Joins the batch parts back into items, one result per requested ID.
///
/// `results` holds the ticket, change log and attachment parts for every
/// ID in that order; anything shorter means the batch itself failed.
fn combine(results: Vec<Result<Record>>, ids: &[u64], options: GetOptions) -> Vec<Result<Record>> {
    if results.len() != ids.len() * 3 {
        let err = results
            .into_iter()
            .find_map(Result::err)
            .unwrap_or_else(|| Error::parsing("incomplete ticket batch"));
        return vec![Err(err)];
    }

    let mut results = results.into_iter();
    let tickets: Vec<Result<Record>> = results.by_ref().take(ids.len()).collect();
    let logs: Vec<Result<Record>> = results.by_ref().take(ids.len()).collect();

    ids.iter()
        .zip(tickets)
        .zip(logs)
        .zip(results)
        .map(|(((&id, ticket), log), files)| {
            join(ticket, log, files, options).map_err(|err| missing_ticket(id, err))
        })
        .collect()
}

fn join(ticket: Result<Record>, log: Result<Record>, files: Result<Record>, options: GetOptions) -> Result<Record> {
    let mut item = ticket?
        .into_item()
        .ok_or_else(|| Error::parsing("unexpected ticket.get result"))?;
    if let Record::Value(log) = log? {
        let (comments, changes) = changelog(&log);
        if options.comments {
            item.comments = with_description(item.description_comment(), comments);
        }
        if options.changes {
            item.changes = changes;
        }
    }
    item.attachments = files?
        .into_list()
        .into_iter()
        .filter_map(|r| match r {
            Record::Attachment(a) => Some(a),
            _ => None,
        })
        .collect();
    Ok(Record::from(item))
}

/// Trac reports missing tickets as a 404 fault code.
fn is_missing(err: &Error) -> bool {
    match err {
        Error::MulticallFault { source, .. } => {
            matches!(**source, Error::Service { code: Some(404), .. })
        }
        Error::Service { code: Some(404), .. } => true,
        _ => false,
    }
}

fn missing_ticket(id: u64, err: Error) -> Error {
    if is_missing(&err) {
        Error::NonexistentItem { ids: vec![id] }
    } else {
        err
    }
}

/// ID of the ticket whose call faulted, for batches of one call per ID.
fn fault_id(err: &Error, ids: &[u64]) -> Option<u64> {
    match err {
        Error::MulticallFault { index, .. } => ids.get(*index).copied(),
        _ => None,
    }
}

/// Whole-call failures, where no single ticket can be blamed.
fn missing_ticket_hook(ids: &[u64]) -> ErrorHook {
    let not_found = nonexistent_hook(ids);
    let ids = ids.to_vec();
    Arc::new(move |err| {
        if is_missing(&err) {
            Error::NonexistentItem { ids: ids.clone() }
        } else {
            not_found(err)
        }
    })
}

/// Trac query string for the common search options.
fn query_string(query: &SearchQuery) -> String {
    let mut parts = Vec::new();
    for term in &query.terms {
        parts.push(format!("summary~{}", term));
    }
    if !query.status.is_empty() {
        parts.push(format!("status={}", query.status.join("|")));
    }
    if let Some(creator) = &query.creator {
        parts.push(format!("reporter={}", creator));
    }
    if let Some(owner) = &query.owner {
        parts.push(format!("owner={}", owner));
    }
    if let Some(created) = &query.created {
        parts.push(format!("time={}..", created.format("%Y-%m-%d")));
    }
    parts.push(format!("max={}", query.limit.unwrap_or(0)));
    if let Some(page) = query.page {
        parts.push(format!("page={}", page));
    }
    parts.push("order=id".to_string());
    parts.join("&")
}

impl Trac {
    fn get_request(&self, ids: &[u64], options: GetOptions) -> CompositeRequest {
        let wanted = ids.to_vec();
        CompositeRequest::new(vec![self.batch(ids, options).into()], move |_, streams| {
            let ids = wanted.clone();
            stream::once(async move {
                let results: Vec<Result<Record>> = stream::iter(streams).flatten().collect().await;
                stream::iter(combine(results, &ids, options))
            })
            .flatten()
            .boxed()
        })
        .many()
        .on_error(missing_ticket_hook(ids))
    }
}

impl Tracker for Trac {
    fn kind(&self) -> ServiceKind {
        match self.protocol {
            ProtocolKind::XmlRpc => ServiceKind::TracXmlrpc,
            _ => ServiceKind::TracJsonrpc,
        }
    }

    fn api_root(&self) -> &str {
        &self.api
    }

    fn default_max_results(&self) -> usize {
        0
    }

    fn protocol(&self) -> ProtocolKind {
        self.protocol
    }

    fn get(&self, _service: &Service, ids: &[u64], options: GetOptions) -> Result<Request> {
        Ok(self.get_request(ids, options).into())
    }

    /// `ticket.query` only returns IDs; matching tickets are fetched with a
    /// follow-up batch once the IDs are known.
    fn search(&self, _service: &Service, query: &SearchQuery) -> Result<Request> {
        require_terms(query)?;

        let mut ids = LeafRequest::rpc("ticket.query")
            .args(vec![Value::from(query_string(query))])
            .parser(|reply| {
                let ids = reply.data.as_array().cloned().unwrap_or_default();
                Ok(ids.into_iter().map(Record::Value).collect())
            })
            .many();
        for option in search_options(query) {
            ids.push_option(option);
        }

        let this = self.clone();
        Ok(CompositeRequest::new(vec![ids.into()], move |service, streams| {
            let this = this.clone();
            stream::once(async move {
                let records: Vec<Record> = stream::iter(streams).flatten().try_collect().await?;
                let ids: Vec<u64> = records
                    .into_iter()
                    .filter_map(|r| r.into_value().and_then(|v| v.as_u64()))
                    .collect();
                if ids.is_empty() {
                    return Ok(stream::empty::<Result<Record>>().boxed());
                }
                let output = service.send(this.get_request(&ids, GetOptions::new())).await?;
                Ok::<_, Error>(output.into_stream())
            })
            .try_flatten()
            .boxed()
        })
        .many()
        .into())
    }

    fn comments(&self, _service: &Service, ids: &[u64]) -> Result<Request> {
        self.log_request(ids, |log| {
            let (comments, _) = changelog(log);
            Record::List(comments.into_iter().map(Record::Comment).collect())
        })
    }

    fn attachments(&self, _service: &Service, ids: &[u64]) -> Result<Request> {
        let parts = ids
            .iter()
            .map(|&id| {
                MulticallPart::new(Self::calls("ticket.listAttachments", &[id]), |results| {
                    Ok(Record::List(attachments(&single(results)?)))
                })
            })
            .collect();
        Ok(flatten_parts(parts, ids))
    }

    fn changes(&self, _service: &Service, ids: &[u64]) -> Result<Request> {
        self.log_request(ids, |log| {
            let (_, changes) = changelog(log);
            Record::List(changes.into_iter().map(Record::Change).collect())
        })
    }

    fn version(&self, _service: &Service) -> Result<Request> {
        Ok(LeafRequest::rpc("system.getAPIVersion")
            .args(Vec::new())
            .parser(|reply| {
                let parts: Vec<String> = reply
                    .data
                    .as_array()
                    .into_iter()
                    .flatten()
                    .map(|v| v.to_string())
                    .collect();
                Ok(vec![Record::Value(Value::from(parts.join(".")))])
            })
            .into())
    }
}

impl Trac {
    fn log_request<F>(&self, ids: &[u64], parse: F) -> Result<Request>
    where
        F: Fn(&Value) -> Record + Send + Sync + 'static,
    {
        let parse = Arc::new(parse);
        let parts = ids
            .iter()
            .map(|&id| {
                let parse = Arc::clone(&parse);
                MulticallPart::new(Self::calls("ticket.changeLog", &[id]), move |results| {
                    Ok(parse(&single(results)?))
                })
            })
            .collect();
        Ok(flatten_parts(parts, ids))
    }
}

/// Records of one-call parts, flattened in ID order.
///
/// A faulted call fails only its own ID; the other IDs are still yielded.
fn flatten_parts(parts: Vec<MulticallPart>, ids: &[u64]) -> Request {
    let wanted = ids.to_vec();
    CompositeRequest::new(vec![MergedMulticall::new(parts).into()], move |_, streams| {
        let ids = wanted.clone();
        stream::iter(streams)
            .flatten()
            .map(move |result| {
                result.map_err(|err| match fault_id(&err, &ids) {
                    Some(id) => missing_ticket(id, err),
                    None => err,
                })
            })
            .map_ok(|record| stream::iter(record.into_list().into_iter().map(Ok::<Record, Error>)))
            .try_flatten()
            .boxed()
    })
    .many()
    .on_error(missing_ticket_hook(ids))
    .into()
}
