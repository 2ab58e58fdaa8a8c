use serde_json::Value;

use super::{require_terms, search_options};
use crate::config::ServiceConfig;
use crate::error::{Error, Result};
use crate::http::RawResponse;
use crate::models::{
    Attachment, Change, Comment, FieldChange, GetOptions, Item, SearchQuery, id_of, number_comments,
    parse_time, string, with_description,
};
use crate::request::{CompositeRequest, LeafRequest, PagedRequest, Paging, Record, Request, nonexistent_hook};
use crate::service::tracker::{auth_failure, error_body};
use crate::service::{Service, ServiceKind, Tracker};

const MAX_RESULTS: usize = 1000;

#[derive(Debug, Clone)]
pub struct Jira {
    base: String,
    api: String,
}

impl Jira {
    pub fn new(config: &ServiceConfig) -> Self {
        Self {
            base: config.base.clone(),
            api: format!("{}/rest/api/2", config.base),
        }
    }

    fn item(&self, issue: &Value, options: GetOptions) -> Item {
        let fields = &issue["fields"];
        let mut item = Item::new(id_of(issue, "id").unwrap_or_default());
        item.title = string(fields, "summary");
        item.creator = display_name(&fields["creator"]).or_else(|| display_name(&fields["reporter"]));
        item.owner = display_name(&fields["assignee"]);
        item.created = parse_time(&fields["created"]);
        item.modified = parse_time(&fields["updated"]);
        item.status = string(&fields["status"], "name");
        item.description = string(fields, "description");
        if let Some(key) = string(issue, "key") {
            item.url = Some(format!("{}/browse/{}", self.base, key));
            item.fields.insert("key".to_string(), Value::from(key));
        }
        for key in ["priority", "issuetype", "resolution"] {
            if let Some(name) = string(&fields[key], "name") {
                item.fields.insert(key.to_string(), Value::from(name));
            }
        }
        if let Some(labels) = fields.get("labels").filter(|v| v.is_array()) {
            item.fields.insert("labels".to_string(), labels.clone());
        }

        if options.comments {
            let comments = parse_comments(&fields["comment"]["comments"]);
            item.comments = with_description(item.description_comment(), comments);
        }
        if options.attachments {
            item.attachments = parse_attachments(&fields["attachment"]);
        }
        if options.changes {
            item.changes = parse_changelog(&issue["changelog"]["histories"]);
        }
        item
    }

    fn issue_request(&self, id: u64, options: GetOptions) -> LeafRequest {
        let mut request = LeafRequest::get(format!("/issue/{}", id));
        if options.changes {
            request = request.param("expand", "changelog");
        }
        let this = self.clone();
        request
            .parser(move |reply| Ok(vec![Record::from(this.item(&reply.data, options))]))
            .on_error(nonexistent_hook(&[id]))
    }

    fn per_issue<F>(&self, ids: &[u64], build: F) -> Request
    where
        F: Fn(u64) -> LeafRequest,
    {
        let children = ids
            .iter()
            .map(|id| build(*id).on_error(nonexistent_hook(&[*id])).into())
            .collect();
        CompositeRequest::group(children).into()
    }
}

fn display_name(user: &Value) -> Option<String> {
    string(user, "displayName").or_else(|| string(user, "name"))
}

fn parse_comments(comments: &Value) -> Vec<Comment> {
    let mut comments: Vec<Comment> = comments
        .as_array()
        .into_iter()
        .flatten()
        .map(|c| Comment {
            id: id_of(c, "id"),
            count: 0,
            creator: display_name(&c["author"]),
            created: parse_time(&c["created"]),
            text: string(c, "body").unwrap_or_default(),
        })
        .collect();
    number_comments(&mut comments, 1);
    comments
}

fn parse_attachments(attachments: &Value) -> Vec<Attachment> {
    attachments
        .as_array()
        .into_iter()
        .flatten()
        .map(|a| {
            let mut attachment = Attachment::new(id_of(a, "id"), &string(a, "filename").unwrap_or_default());
            attachment.size = a["size"].as_u64();
            attachment.mimetype = string(a, "mimeType");
            attachment.creator = display_name(&a["author"]);
            attachment.created = parse_time(&a["created"]);
            attachment.url = string(a, "content");
            attachment
        })
        .collect()
}

fn parse_changelog(histories: &Value) -> Vec<Change> {
    histories
        .as_array()
        .into_iter()
        .flatten()
        .enumerate()
        .map(|(i, h)| Change {
            id: id_of(h, "id"),
            count: i as u64 + 1,
            creator: display_name(&h["author"]),
            created: parse_time(&h["created"]),
            changes: h["items"]
                .as_array()
                .into_iter()
                .flatten()
                .filter_map(|c| {
                    let field = string(c, "field")?;
                    Some((
                        field,
                        FieldChange {
                            removed: string(c, "fromString"),
                            added: string(c, "toString"),
                        },
                    ))
                })
                .collect(),
        })
        .collect()
}

/// JQL for the common search options.
fn jql(query: &SearchQuery) -> String {
    let quote = |s: &str| format!("\"{}\"", s.replace('"', "\\\""));
    let mut clauses = Vec::new();
    for term in &query.terms {
        clauses.push(format!("summary ~ {}", quote(term)));
    }
    if !query.status.is_empty() {
        let status: Vec<String> = query.status.iter().map(|s| quote(s)).collect();
        clauses.push(format!("status in ({})", status.join(", ")));
    }
    if let Some(creator) = &query.creator {
        clauses.push(format!("reporter = {}", quote(creator)));
    }
    if let Some(owner) = &query.owner {
        clauses.push(format!("assignee = {}", quote(owner)));
    }
    if let Some(created) = &query.created {
        clauses.push(format!("created >= \"{}\"", created.format("%Y-%m-%d %H:%M")));
    }
    clauses.join(" AND ")
}

impl Tracker for Jira {
    fn kind(&self) -> ServiceKind {
        ServiceKind::Jira
    }

    fn api_root(&self) -> &str {
        &self.api
    }

    fn default_max_results(&self) -> usize {
        MAX_RESULTS
    }

    fn failure(&self, response: &RawResponse) -> Option<Error> {
        let body = error_body(response)?;
        let mut messages: Vec<String> = body["errorMessages"]
            .as_array()
            .into_iter()
            .flatten()
            .filter_map(|m| m.as_str().map(str::to_string))
            .collect();
        if let Some(errors) = body["errors"].as_object() {
            messages.extend(errors.iter().map(|(k, v)| format!("{}: {}", k, v.as_str().unwrap_or_default())));
        }
        if messages.is_empty() {
            return None;
        }
        let msg = messages.join("; ");
        match response.status {
            401 | 403 => Some(auth_failure(response, Some(&msg))),
            // not-found keeps its HTTP shape so get requests can translate it
            404 => Some(Error::Request {
                msg,
                code: Some(404),
                text: Some(response.body.clone()),
            }),
            status => Some(self.service_error(Some(i64::from(status)), msg)),
        }
    }

    fn get(&self, _service: &Service, ids: &[u64], options: GetOptions) -> Result<Request> {
        let children = ids
            .iter()
            .map(|id| self.issue_request(*id, options).into())
            .collect();
        Ok(CompositeRequest::group(children).into())
    }

    fn search(&self, service: &Service, query: &SearchQuery) -> Result<Request> {
        require_terms(query)?;

        let mut request = LeafRequest::post("/search").param("jql", jql(query));
        if !query.fields.is_empty() {
            request = request.param("fields", Value::from(query.fields.clone()));
        }
        for option in search_options(query) {
            request.push_option(option);
        }

        let this = self.clone();
        let request = request
            .parser(move |reply| {
                let issues = reply.data["issues"].as_array().cloned().unwrap_or_default();
                Ok(issues
                    .iter()
                    .map(|issue| Record::from(this.item(issue, GetOptions::new())))
                    .collect())
            })
            .many();

        Ok(PagedRequest::new(request, Paging::offset("startAt", "maxResults"))
            .limit(query.limit, service.max_results())
            .start(query.offset)
            .into())
    }

    fn comments(&self, _service: &Service, ids: &[u64]) -> Result<Request> {
        Ok(self.per_issue(ids, |id| {
            LeafRequest::get(format!("/issue/{}/comment", id)).parser(|reply| {
                let comments = parse_comments(&reply.data["comments"]);
                Ok(vec![Record::List(comments.into_iter().map(Record::Comment).collect())])
            })
        }))
    }

    fn attachments(&self, _service: &Service, ids: &[u64]) -> Result<Request> {
        Ok(self.per_issue(ids, |id| {
            LeafRequest::get(format!("/issue/{}", id))
                .param("fields", "attachment")
                .parser(|reply| {
                    let attachments = parse_attachments(&reply.data["fields"]["attachment"]);
                    Ok(vec![Record::List(attachments.into_iter().map(Record::Attachment).collect())])
                })
        }))
    }

    fn changes(&self, _service: &Service, ids: &[u64]) -> Result<Request> {
        Ok(self.per_issue(ids, |id| {
            LeafRequest::get(format!("/issue/{}", id))
                .param("expand", "changelog")
                .param("fields", "none")
                .parser(|reply| {
                    let changes = parse_changelog(&reply.data["changelog"]["histories"]);
                    Ok(vec![Record::List(changes.into_iter().map(Record::Change).collect())])
                })
        }))
    }

    fn version(&self, _service: &Service) -> Result<Request> {
        Ok(LeafRequest::get("/serverInfo")
            .parser(|reply| Ok(vec![Record::Value(reply.data["version"].clone())]))
            .into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use serde_json::json;

    #[test]
    fn test_jql_from_query() {
        let query = SearchQuery::new()
            .terms(vec!["crash".to_string()])
            .status(vec!["Open".to_string(), "In Progress".to_string()])
            .owner("alice")
            .created(Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap());

        assert_eq!(
            jql(&query),
            "summary ~ \"crash\" AND status in (\"Open\", \"In Progress\") AND assignee = \"alice\" AND created >= \"2024-03-01 12:00\""
        );
    }

    #[test]
    fn test_issue_parsing_with_description() {
        // Given: コメント付きの課題レスポンス
        let config = ServiceConfig::new("https://jira.example.org", ServiceKind::Jira).unwrap();
        let jira = Jira::new(&config);
        let issue = json!({
            "id": "10001",
            "key": "PROJ-1",
            "fields": {
                "summary": "Broken build",
                "description": "It fails",
                "reporter": {"displayName": "Alice"},
                "status": {"name": "Open"},
                "comment": {"comments": [
                    {"id": "1", "author": {"displayName": "Bob"}, "body": "seen it"}
                ]}
            }
        });

        // When: コメント込みで変換
        let item = jira.item(&issue, GetOptions::new().comments(true));

        // Then: 説明が#0、サーバのコメントが#1から並ぶ
        assert_eq!(item.id, 10001);
        assert_eq!(item.url.as_deref(), Some("https://jira.example.org/browse/PROJ-1"));
        let counts: Vec<u64> = item.comments.iter().map(|c| c.count).collect();
        assert_eq!(counts, vec![0, 1]);
        assert_eq!(item.comments[0].text, "It fails");
        assert_eq!(item.comments[1].creator.as_deref(), Some("Bob"));
    }

    #[test]
    fn test_changelog_parsing() {
        let changes = parse_changelog(&json!([
            {"id": "5", "author": {"name": "carol"}, "created": "2024-01-02T03:04:05.000+0000",
             "items": [{"field": "status", "fromString": "Open", "toString": "Closed"}]}
        ]));
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].count, 1);
        assert!(changes[0].touches(&["status"]));
        assert!(changes[0].created.is_some());
    }
}
