use std::sync::Arc;

use serde_json::Value;

use super::{id_list, numbers, require_terms, search_options, strings};
use crate::config::ServiceConfig;
use crate::error::{Error, Result};
use crate::http::{RawResponse, Reply};
use crate::models::{
    Attachment, Change, Comment, FieldChange, GetOptions, Item, SearchQuery, id_of, parse_time,
    string,
};
use crate::protocol::ProtocolKind;
use crate::request::{
    CompositeRequest, ErrorHook, LeafRequest, NullRequest, PagedRequest, Paging, Params, Record,
    Request, nonexistent_hook,
};
use crate::service::tracker::{auth_failure, error_body};
use crate::service::{Service, ServiceKind, Tracker};

const MAX_RESULTS: usize = 10000;

/// API keys are longer than login tokens.
const API_KEY_MIN_LEN: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Flavor {
    Rest { header_auth: bool },
    Rpc(ProtocolKind),
}

/// Bugzilla over its REST API (param or 5.2 header auth), JSON-RPC or
/// XML-RPC. All of them expose the same data shapes.
#[derive(Debug, Clone)]
pub struct Bugzilla {
    kind: ServiceKind,
    base: String,
    api: String,
    flavor: Flavor,
}

impl Bugzilla {
    pub fn rest(config: &ServiceConfig, header_auth: bool) -> Self {
        Self {
            kind: if header_auth {
                ServiceKind::Bugzilla52Rest
            } else {
                ServiceKind::BugzillaRest
            },
            base: config.base.clone(),
            api: format!("{}/rest", config.base),
            flavor: Flavor::Rest { header_auth },
        }
    }

    pub fn jsonrpc(config: &ServiceConfig) -> Self {
        Self::rpc(config, ServiceKind::BugzillaJsonrpc, ProtocolKind::JsonRpc, "jsonrpc.cgi")
    }

    /// The deprecated XML-RPC interface.
    pub fn xmlrpc(config: &ServiceConfig) -> Self {
        Self::rpc(config, ServiceKind::BugzillaXmlrpc, ProtocolKind::XmlRpc, "xmlrpc.cgi")
    }

    fn rpc(config: &ServiceConfig, kind: ServiceKind, protocol: ProtocolKind, endpoint: &str) -> Self {
        Self {
            kind,
            base: config.base.clone(),
            api: format!("{}/{}", config.base, endpoint),
            flavor: Flavor::Rpc(protocol),
        }
    }

    fn request(&self, method: &str, path: String) -> LeafRequest {
        match self.flavor {
            Flavor::Rest { .. } => LeafRequest::get(path),
            Flavor::Rpc(_) => LeafRequest::rpc(method),
        }
    }

    fn ids_key(&self) -> &'static str {
        match self.flavor {
            Flavor::Rest { .. } => "id",
            Flavor::Rpc(_) => "ids",
        }
    }

    fn item(&self, bug: &Value) -> Item {
        let id = id_of(bug, "id").unwrap_or_default();
        let mut item = Item::new(id);
        item.title = string(bug, "summary");
        item.creator = string(bug, "creator");
        item.owner = string(bug, "assigned_to");
        item.created = parse_time(&bug["creation_time"]);
        item.modified = parse_time(&bug["last_change_time"]);
        item.status = string(bug, "status");
        item.url = Some(format!("{}/show_bug.cgi?id={}", self.base, id));
        item.cc = strings(&bug["cc"]);
        item.blocks = numbers(&bug["blocks"]);
        item.depends = numbers(&bug["depends_on"]);
        for key in ["product", "component", "resolution", "severity", "priority", "version"] {
            if let Some(value) = bug.get(key).filter(|v| !v.is_null()) {
                item.fields.insert(key.to_string(), value.clone());
            }
        }
        item
    }

    fn get_item(&self, ids: &[u64]) -> LeafRequest {
        let this = self.clone();
        self.request("Bug.get", "/bug".to_string())
            .param(self.ids_key(), id_list(ids))
            .parser(move |reply| {
                let bugs = reply.data["bugs"]
                    .as_array()
                    .ok_or_else(|| Error::parsing("missing bugs in response"))?;
                Ok(bugs.iter().map(|bug| Record::from(this.item(bug))).collect())
            })
            .many()
    }

    fn comments_request(&self, ids: &[u64]) -> LeafRequest {
        let order = ids.to_vec();
        self.request("Bug.comments", format!("/bug/{}/comment", first(ids)))
            .param("ids", id_list(ids))
            .parser(move |reply| per_bug(&reply, &order, |data| Ok(parse_comments(&data["comments"]))))
            .many()
    }

    fn attachments_request(&self, ids: &[u64]) -> LeafRequest {
        let order = ids.to_vec();
        self.request("Bug.attachments", format!("/bug/{}/attachment", first(ids)))
            .param("ids", id_list(ids))
            .param("exclude_fields", Value::from(vec!["data"]))
            .parser(move |reply| per_bug(&reply, &order, parse_attachments))
            .many()
    }

    fn history_request(&self, ids: &[u64]) -> LeafRequest {
        let order = ids.to_vec();
        self.request("Bug.history", format!("/bug/{}/history", first(ids)))
            .param("ids", id_list(ids))
            .parser(move |reply| {
                let bugs = reply.data["bugs"]
                    .as_array()
                    .ok_or_else(|| Error::parsing("missing bugs in response"))?;
                let mut records = Vec::with_capacity(order.len());
                for id in &order {
                    let history = bugs
                        .iter()
                        .find(|bug| id_of(bug, "id") == Some(*id))
                        .map(|bug| parse_history(&bug["history"]))
                        .unwrap_or_default();
                    records.push(Record::List(history));
                }
                Ok(records)
            })
            .many()
    }
}

fn first(ids: &[u64]) -> u64 {
    ids.first().copied().unwrap_or_default()
}

/// Splits a `{"bugs": {"<id>": ...}}` reply into one list per requested id.
fn per_bug<F>(reply: &Reply, order: &[u64], parse: F) -> Result<Vec<Record>>
where
    F: Fn(&Value) -> Result<Vec<Record>>,
{
    let bugs = reply.data["bugs"]
        .as_object()
        .ok_or_else(|| Error::parsing("missing bugs in response"))?;
    order
        .iter()
        .map(|id| match bugs.get(&id.to_string()) {
            Some(data) => parse(data).map(Record::List),
            None => Ok(Record::List(Vec::new())),
        })
        .collect()
}

fn parse_comments(comments: &Value) -> Vec<Record> {
    comments
        .as_array()
        .map(|list| {
            list.iter()
                .enumerate()
                .map(|(i, c)| {
                    Record::Comment(Comment {
                        id: id_of(c, "id"),
                        count: c["count"].as_u64().unwrap_or(i as u64),
                        creator: string(c, "creator"),
                        created: parse_time(&c["creation_time"]),
                        text: string(c, "text").unwrap_or_default(),
                    })
                })
                .collect()
        })
        .unwrap_or_default()
}

fn parse_attachments(attachments: &Value) -> Result<Vec<Record>> {
    let Some(list) = attachments.as_array() else {
        return Ok(Vec::new());
    };
    list.iter()
        .map(|a| {
            let mut attachment = Attachment::new(id_of(a, "id"), &string(a, "file_name").unwrap_or_default());
            attachment.size = a["size"].as_u64();
            attachment.mimetype = string(a, "content_type");
            attachment.creator = string(a, "creator");
            attachment.created = parse_time(&a["creation_time"]);
            if let Some(data) = a["data"].as_str() {
                attachment = attachment.with_base64_data(data)?;
            }
            Ok(Record::Attachment(attachment))
        })
        .collect()
}

fn parse_history(history: &Value) -> Vec<Record> {
    history
        .as_array()
        .map(|list| {
            list.iter()
                .enumerate()
                .map(|(i, h)| {
                    let mut change = Change {
                        id: None,
                        count: i as u64 + 1,
                        creator: string(h, "who"),
                        created: parse_time(&h["when"]),
                        ..Default::default()
                    };
                    for c in h["changes"].as_array().into_iter().flatten() {
                        if let Some(field) = string(c, "field_name") {
                            change.changes.insert(
                                field,
                                FieldChange {
                                    removed: string(c, "removed").filter(|s| !s.is_empty()),
                                    added: string(c, "added").filter(|s| !s.is_empty()),
                                },
                            );
                        }
                    }
                    Record::Change(change)
                })
                .collect()
        })
        .unwrap_or_default()
}

/// Missing bugs come back as 100/101 faults rather than 404s.
fn missing_bug_hook(ids: &[u64]) -> ErrorHook {
    let not_found = nonexistent_hook(ids);
    let ids = ids.to_vec();
    Arc::new(move |err| match err {
        Error::Service {
            code: Some(100 | 101),
            ..
        } => Error::NonexistentItem { ids: ids.clone() },
        err => not_found(err),
    })
}

impl Tracker for Bugzilla {
    fn kind(&self) -> ServiceKind {
        self.kind
    }

    fn api_root(&self) -> &str {
        &self.api
    }

    fn default_max_results(&self) -> usize {
        MAX_RESULTS
    }

    fn protocol(&self) -> ProtocolKind {
        match self.flavor {
            Flavor::Rest { .. } => ProtocolKind::Rest,
            Flavor::Rpc(protocol) => protocol,
        }
    }

    fn inject_auth(
        &self,
        config: &ServiceConfig,
        token: Option<&str>,
        params: &mut Params,
        headers: &mut Vec<(String, String)>,
    ) {
        match token {
            Some(token) => {
                let is_key = token.len() > API_KEY_MIN_LEN;
                match self.flavor {
                    Flavor::Rest { header_auth: true } => {
                        let name = if is_key { "X-BUGZILLA-API-KEY" } else { "X-BUGZILLA-TOKEN" };
                        headers.push((name.to_string(), token.to_string()));
                    }
                    _ => {
                        let name = if is_key { "Bugzilla_api_key" } else { "Bugzilla_token" };
                        params.insert(name.to_string(), Value::from(token));
                    }
                }
            }
            None => {
                if let (Some(user), Some(password)) = (&config.user, &config.password) {
                    params.insert("Bugzilla_login".to_string(), Value::from(user.as_str()));
                    params.insert("Bugzilla_password".to_string(), Value::from(password.as_str()));
                }
            }
        }
    }

    fn service_error(&self, code: Option<i64>, msg: String) -> Error {
        match code {
            Some(32000) if msg.to_lowercase().contains("expired") => Error::Auth {
                msg,
                code,
                expired: true,
            },
            Some(102) | Some(410) => Error::Auth {
                msg,
                code,
                expired: false,
            },
            _ => Error::Service {
                service: "bugzilla".to_string(),
                msg,
                code,
            },
        }
    }

    fn check_response(&self, data: Value) -> Result<Value> {
        if data.get("error").and_then(Value::as_bool) == Some(true) {
            let code = data["code"].as_i64();
            let msg = string(&data, "message").unwrap_or_else(|| "unknown error".to_string());
            return Err(self.service_error(code, msg));
        }
        Ok(data)
    }

    fn failure(&self, response: &RawResponse) -> Option<Error> {
        let body = error_body(response)?;
        let msg = string(&body, "message")?;
        let err = self.service_error(body["code"].as_i64(), msg.clone());
        match (response.status, &err) {
            (_, Error::Auth { .. }) => Some(err),
            (401 | 403, _) => Some(auth_failure(response, Some(&msg))),
            _ => Some(err),
        }
    }

    fn get(&self, _service: &Service, ids: &[u64], options: GetOptions) -> Result<Request> {
        let optional = |wanted: bool, request: LeafRequest| -> Request {
            if wanted {
                request.into()
            } else {
                NullRequest::new().into()
            }
        };

        let children = vec![
            self.get_item(ids).into(),
            optional(options.comments, self.comments_request(ids)),
            optional(options.attachments, self.attachments_request(ids)),
            optional(options.changes, self.history_request(ids)),
        ];
        Ok(CompositeRequest::assemble(children, false)
            .on_error(missing_bug_hook(ids))
            .into())
    }

    fn search(&self, service: &Service, query: &SearchQuery) -> Result<Request> {
        require_terms(query)?;

        let mut request = self.request("Bug.search", "/bug".to_string());
        if !query.terms.is_empty() {
            request = request.param("summary", query.terms.join(" "));
        }
        if !query.status.is_empty() {
            request = request.param("status", Value::from(query.status.clone()));
        }
        if let Some(creator) = &query.creator {
            request = request.param("creator", creator.as_str());
        }
        if let Some(owner) = &query.owner {
            request = request.param("assigned_to", owner.as_str());
        }
        if let Some(created) = &query.created {
            request = request.param("creation_time", created.to_rfc3339());
        }
        if !query.fields.is_empty() {
            request = request.param("include_fields", Value::from(query.fields.clone()));
        }
        for option in search_options(query) {
            request.push_option(option);
        }

        let this = self.clone();
        let request = request
            .parser(move |reply| {
                let bugs = reply.data["bugs"].as_array().cloned().unwrap_or_default();
                Ok(bugs.iter().map(|bug| Record::from(this.item(bug))).collect())
            })
            .many();

        Ok(PagedRequest::new(request, Paging::offset("offset", "limit"))
            .limit(query.limit, service.max_results())
            .start(query.offset)
            .into())
    }

    fn comments(&self, _service: &Service, ids: &[u64]) -> Result<Request> {
        Ok(self.comments_request(ids).into())
    }

    fn attachments(&self, _service: &Service, ids: &[u64]) -> Result<Request> {
        Ok(self.attachments_request(ids).into())
    }

    fn changes(&self, _service: &Service, ids: &[u64]) -> Result<Request> {
        Ok(self.history_request(ids).into())
    }

    fn modify(&self, _service: &Service, ids: &[u64], changes: &Params) -> Result<Request> {
        let mut request = match self.flavor {
            Flavor::Rest { .. } => LeafRequest::put(format!("/bug/{}", first(ids))),
            Flavor::Rpc(_) => LeafRequest::rpc("Bug.update"),
        };
        for (key, value) in changes {
            request = request.param(key.as_str(), value.clone());
        }
        Ok(request
            .param("ids", id_list(ids))
            .option(format!("Modifying: {}", ids.iter().map(u64::to_string).collect::<Vec<_>>().join(", ")))
            .parser(|reply| {
                let bugs = reply.data["bugs"].as_array().cloned().unwrap_or_default();
                Ok(bugs.into_iter().map(Record::Value).collect())
            })
            .many()
            .on_error(missing_bug_hook(ids))
            .into())
    }

    fn version(&self, _service: &Service) -> Result<Request> {
        Ok(self
            .request("Bugzilla.version", "/version".to_string())
            .parser(|reply| Ok(vec![Record::Value(reply.data["version"].clone())]))
            .into())
    }

    fn login(&self, _service: &Service, user: &str, password: &str) -> Result<Request> {
        Ok(self
            .request("User.login", "/login".to_string())
            .param("login", user)
            .param("password", password)
            .parser(|reply| match reply.data.get("token").and_then(Value::as_str) {
                Some(token) => Ok(vec![Record::Value(Value::from(token))]),
                None => Err(Error::parsing("login response contained no token")),
            })
            .into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn tracker() -> Bugzilla {
        let config = ServiceConfig::new("https://bugs.example.org", ServiceKind::BugzillaRest).unwrap();
        Bugzilla::rest(&config, false)
    }

    #[test]
    fn test_error_mapping() {
        let bz = tracker();

        let err = bz.service_error(Some(32000), "The token has expired".to_string());
        assert!(err.is_expired_auth());

        let err = bz.service_error(Some(410), "You must log in".to_string());
        assert!(matches!(err, Error::Auth { expired: false, .. }));

        let err = bz.service_error(Some(101), "Bug #9 does not exist.".to_string());
        assert_eq!(err.to_string(), "bugzilla error: Bug #9 does not exist.");
    }

    #[test]
    fn test_auth_injection_picks_key_or_token() {
        let bz = tracker();
        let config = ServiceConfig::new("https://bugs.example.org", ServiceKind::BugzillaRest).unwrap();

        let mut params = Params::new();
        let mut headers = Vec::new();
        bz.inject_auth(&config, Some("12-abcdef"), &mut params, &mut headers);
        assert_eq!(params["Bugzilla_token"], "12-abcdef");

        let mut params = Params::new();
        bz.inject_auth(&config, Some("0123456789abcdefghij"), &mut params, &mut headers);
        assert_eq!(params["Bugzilla_api_key"], "0123456789abcdefghij");
        assert!(headers.is_empty());

        let header_bz = Bugzilla::rest(&config, true);
        let mut params = Params::new();
        header_bz.inject_auth(&config, Some("0123456789abcdefghij"), &mut params, &mut headers);
        assert!(params.is_empty());
        assert_eq!(
            headers,
            vec![("X-BUGZILLA-API-KEY".to_string(), "0123456789abcdefghij".to_string())]
        );
    }

    #[test]
    fn test_check_response_raises_embedded_error() {
        let bz = tracker();
        let result = bz.check_response(json!({"error": true, "code": 102, "message": "denied"}));
        assert!(matches!(result, Err(Error::Auth { .. })));

        let data = json!({"bugs": []});
        assert_eq!(bz.check_response(data.clone()).unwrap(), data);
    }

    #[test]
    fn test_history_counts_start_at_one() {
        let records = parse_history(&json!([
            {"who": "a", "when": "2024-01-01T00:00:00Z", "changes": [
                {"field_name": "status", "removed": "NEW", "added": "ASSIGNED"}
            ]},
            {"who": "b", "when": "2024-01-02T00:00:00Z", "changes": []}
        ]));

        let counts: Vec<u64> = records
            .iter()
            .map(|r| match r {
                Record::Change(c) => c.count,
                _ => 0,
            })
            .collect();
        assert_eq!(counts, vec![1, 2]);
    }

    #[test]
    fn test_comments_keep_server_numbering() {
        let records = parse_comments(&json!([
            {"id": 10, "count": 0, "text": "description", "creator": "a"},
            {"id": 11, "count": 1, "text": "first", "creator": "b"}
        ]));
        assert_eq!(records.len(), 2);
        match &records[0] {
            Record::Comment(c) => assert!(c.is_description()),
            other => panic!("unexpected record: {other:?}"),
        }
    }
}
