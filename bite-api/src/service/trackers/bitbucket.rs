use serde_json::Value;

use super::{numbered, origin, require_terms, search_options, trailing_segments};
use crate::config::ServiceConfig;
use crate::error::{Error, Result};
use crate::http::RawResponse;
use crate::models::{Attachment, Comment, GetOptions, Item, SearchQuery, id_of, parse_time, string};
use crate::request::{
    CompositeRequest, LeafRequest, LinkSource, NullRequest, PagedRequest, Paging, Record, Request,
    nonexistent_hook,
};
use crate::service::tracker::{auth_failure, error_body};
use crate::service::{Service, ServiceKind, Tracker};

const MAX_RESULTS: usize = 50;

/// Bitbucket Cloud issues, `https://bitbucket.org/<workspace>/<repo>`.
#[derive(Debug, Clone)]
pub struct Bitbucket {
    api: String,
}

impl Bitbucket {
    pub fn new(config: &ServiceConfig) -> Result<Self> {
        let url = config.url()?;
        let repo = trailing_segments(config, 2)?.join("/");
        let api_host = match url.host_str() {
            Some("bitbucket.org") => "https://api.bitbucket.org".to_string(),
            _ => origin(&url),
        };
        Ok(Self {
            api: format!("{}/2.0/repositories/{}", api_host, repo),
        })
    }

    fn issue_request(&self, id: u64) -> LeafRequest {
        LeafRequest::get(format!("/issues/{}", id))
            .parser(|reply| Ok(vec![Record::from(item(&reply.data))]))
            .on_error(nonexistent_hook(&[id]))
    }

    fn comments_request(&self, id: u64) -> Request {
        let paged = listing(LeafRequest::get(format!("/issues/{}/comments", id)), |c| Record::Comment(comment(c)));
        numbered(paged.into()).on_error(nonexistent_hook(&[id])).into()
    }

    fn attachments_request(&self, id: u64) -> Request {
        let paged = listing(LeafRequest::get(format!("/issues/{}/attachments", id)), |a| {
            let name = string(a, "name").unwrap_or_default();
            let mut attachment = Attachment::new(None, &name);
            attachment.url = string(&a["links"]["self"], "href");
            Record::Attachment(attachment)
        });
        CompositeRequest::collect(paged.into())
            .on_error(nonexistent_hook(&[id]))
            .into()
    }
}

/// All pages of a `{"values": [...], "next": ...}` listing.
fn listing<F>(page: LeafRequest, parse: F) -> PagedRequest
where
    F: Fn(&Value) -> Record + Send + Sync + 'static,
{
    let page = page
        .parser(move |reply| {
            let values = reply.data["values"].as_array().cloned().unwrap_or_default();
            Ok(values.iter().map(&parse).collect())
        })
        .many();
    PagedRequest::new(page, Paging::link(Some("pagelen"), LinkSource::Body("next".to_string())))
}

fn display_name(user: &Value) -> Option<String> {
    string(user, "display_name").or_else(|| string(user, "nickname"))
}

fn item(issue: &Value) -> Item {
    let mut item = Item::new(id_of(issue, "id").unwrap_or_default());
    item.title = string(issue, "title");
    item.creator = display_name(&issue["reporter"]);
    item.owner = display_name(&issue["assignee"]);
    item.created = parse_time(&issue["created_on"]);
    item.modified = parse_time(&issue["updated_on"]);
    item.status = string(issue, "state");
    item.url = string(&issue["links"]["html"], "href");
    item.description = string(&issue["content"], "raw").filter(|s| !s.is_empty());
    for key in ["kind", "priority"] {
        if let Some(value) = issue.get(key).filter(|v| v.is_string()) {
            item.fields.insert(key.to_string(), value.clone());
        }
    }
    item
}

fn comment(value: &Value) -> Comment {
    Comment {
        id: id_of(value, "id"),
        count: 0,
        creator: display_name(&value["user"]),
        created: parse_time(&value["created_on"]),
        text: string(&value["content"], "raw").unwrap_or_default(),
    }
}

/// BBQL filter for the common search options.
fn bbql(query: &SearchQuery) -> String {
    let quote = |s: &str| format!("\"{}\"", s.replace('"', "\\\""));
    let mut clauses = Vec::new();
    for term in &query.terms {
        clauses.push(format!("title ~ {}", quote(term)));
    }
    if !query.status.is_empty() {
        let any: Vec<String> = query.status.iter().map(|s| format!("state = {}", quote(s))).collect();
        clauses.push(format!("({})", any.join(" OR ")));
    }
    if let Some(creator) = &query.creator {
        clauses.push(format!("reporter.nickname = {}", quote(creator)));
    }
    if let Some(owner) = &query.owner {
        clauses.push(format!("assignee.nickname = {}", quote(owner)));
    }
    if let Some(created) = &query.created {
        clauses.push(format!("created_on >= {}", created.format("%Y-%m-%dT%H:%M:%S%:z")));
    }
    clauses.join(" AND ")
}

impl Tracker for Bitbucket {
    fn kind(&self) -> ServiceKind {
        ServiceKind::Bitbucket
    }

    fn api_root(&self) -> &str {
        &self.api
    }

    fn default_max_results(&self) -> usize {
        MAX_RESULTS
    }

    fn check_response(&self, data: Value) -> Result<Value> {
        if data.get("type").and_then(Value::as_str) == Some("error") {
            let msg = string(&data["error"], "message").unwrap_or_else(|| "unknown error".to_string());
            return Err(self.service_error(None, msg));
        }
        Ok(data)
    }

    fn failure(&self, response: &RawResponse) -> Option<Error> {
        let body = error_body(response)?;
        let msg = string(&body["error"], "message")?;
        match response.status {
            401 | 403 => Some(auth_failure(response, Some(&msg))),
            404 => Some(Error::Request {
                msg,
                code: Some(404),
                text: Some(response.body.clone()),
            }),
            status => Some(self.service_error(Some(i64::from(status)), msg)),
        }
    }

    fn get(&self, _service: &Service, ids: &[u64], options: GetOptions) -> Result<Request> {
        let items = ids.iter().map(|id| self.issue_request(*id).into()).collect();
        let comments: Request = if options.comments {
            CompositeRequest::group(ids.iter().map(|id| self.comments_request(*id)).collect()).into()
        } else {
            NullRequest::new().into()
        };
        let attachments: Request = if options.attachments {
            CompositeRequest::group(ids.iter().map(|id| self.attachments_request(*id)).collect()).into()
        } else {
            NullRequest::new().into()
        };

        Ok(CompositeRequest::assemble(
            vec![CompositeRequest::group(items).into(), comments, attachments],
            options.comments,
        )
        .into())
    }

    fn search(&self, service: &Service, query: &SearchQuery) -> Result<Request> {
        require_terms(query)?;

        let mut page = LeafRequest::get("/issues").param("q", bbql(query)).param("sort", "id");
        for option in search_options(query) {
            page.push_option(option);
        }
        let paged = listing(page, |issue| Record::from(item(issue)));

        Ok(paged.limit(query.limit, service.max_results()).into())
    }

    fn comments(&self, _service: &Service, ids: &[u64]) -> Result<Request> {
        Ok(CompositeRequest::group(ids.iter().map(|id| self.comments_request(*id)).collect()).into())
    }

    fn attachments(&self, _service: &Service, ids: &[u64]) -> Result<Request> {
        Ok(CompositeRequest::group(ids.iter().map(|id| self.attachments_request(*id)).collect()).into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn tracker() -> Bitbucket {
        let config = ServiceConfig::new("https://bitbucket.org/team/repo", ServiceKind::Bitbucket).unwrap();
        Bitbucket::new(&config).unwrap()
    }

    #[test]
    fn test_api_root() {
        assert_eq!(
            tracker().api_root(),
            "https://api.bitbucket.org/2.0/repositories/team/repo"
        );
    }

    #[test]
    fn test_error_body_is_raised() {
        let result = tracker().check_response(json!({"type": "error", "error": {"message": "Repository not found"}}));
        match result {
            Err(err) => assert_eq!(err.to_string(), "bitbucket error: Repository not found"),
            Ok(value) => panic!("expected error, got {value}"),
        }
    }

    #[test]
    fn test_bbql() {
        let query = SearchQuery::new()
            .terms(vec!["leak".to_string()])
            .status(vec!["new".to_string(), "open".to_string()]);
        assert_eq!(bbql(&query), "title ~ \"leak\" AND (state = \"new\" OR state = \"open\")");
    }
}
