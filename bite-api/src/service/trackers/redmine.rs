use serde_json::Value;

use super::{require_terms, search_options};
use crate::config::ServiceConfig;
use crate::error::{Error, Result};
use crate::http::RawResponse;
use crate::models::{
    Attachment, Change, Comment, FieldChange, GetOptions, Item, SearchQuery, id_of, number_comments,
    parse_time, string, with_description,
};
use crate::request::{CompositeRequest, LeafRequest, PagedRequest, Paging, Params, Record, Request, nonexistent_hook};
use crate::service::tracker::{auth_failure, error_body};
use crate::service::{Service, ServiceKind, Tracker};

const MAX_RESULTS: usize = 100;

#[derive(Debug, Clone)]
pub struct Redmine {
    base: String,
}

/// Pieces of an issue's journal history.
#[derive(Debug, Default)]
struct Journals {
    comments: Vec<Comment>,
    changes: Vec<Change>,
}

impl Redmine {
    pub fn new(config: &ServiceConfig) -> Self {
        Self {
            base: config.base.clone(),
        }
    }

    fn item(&self, issue: &Value, options: GetOptions) -> Item {
        let mut item = Item::new(id_of(issue, "id").unwrap_or_default());
        item.title = string(issue, "subject");
        item.creator = string(&issue["author"], "name");
        item.owner = string(&issue["assigned_to"], "name");
        item.created = parse_time(&issue["created_on"]);
        item.modified = parse_time(&issue["updated_on"]);
        item.status = string(&issue["status"], "name");
        item.url = Some(format!("{}/issues/{}", self.base, item.id));
        item.description = string(issue, "description").filter(|s| !s.is_empty());
        for key in ["tracker", "priority", "project", "category"] {
            if let Some(name) = string(&issue[key], "name") {
                item.fields.insert(key.to_string(), Value::from(name));
            }
        }

        let journals = journals(&issue["journals"]);
        if options.comments {
            item.comments = with_description(item.description_comment(), journals.comments);
        }
        if options.changes {
            item.changes = journals.changes;
        }
        if options.attachments {
            item.attachments = attachments(&issue["attachments"]);
        }
        item
    }

    fn issue_request(&self, id: u64, include: &[&str]) -> LeafRequest {
        let mut request = LeafRequest::get(format!("/issues/{}.json", id));
        if !include.is_empty() {
            request = request.param("include", include.join(","));
        }
        request.on_error(nonexistent_hook(&[id]))
    }

    fn per_issue<F>(&self, ids: &[u64], include: &[&str], parse: F) -> Request
    where
        F: Fn(&Value) -> Record + Clone + Send + Sync + 'static,
    {
        let children = ids
            .iter()
            .map(|id| {
                let parse = parse.clone();
                self.issue_request(*id, include)
                    .parser(move |reply| Ok(vec![parse(&reply.data["issue"])]))
                    .into()
            })
            .collect();
        CompositeRequest::group(children).into()
    }
}

fn journals(journals: &Value) -> Journals {
    let mut parsed = Journals::default();
    for journal in journals.as_array().into_iter().flatten() {
        let creator = string(&journal["user"], "name");
        let created = parse_time(&journal["created_on"]);
        if let Some(notes) = string(journal, "notes").filter(|n| !n.is_empty()) {
            parsed.comments.push(Comment {
                id: id_of(journal, "id"),
                count: 0,
                creator: creator.clone(),
                created,
                text: notes,
            });
        }
        let details = journal["details"].as_array().into_iter().flatten();
        let changes: std::collections::BTreeMap<String, FieldChange> = details
            .filter_map(|d| {
                Some((
                    string(d, "name")?,
                    FieldChange {
                        removed: string(d, "old_value"),
                        added: string(d, "new_value"),
                    },
                ))
            })
            .collect();
        if !changes.is_empty() {
            parsed.changes.push(Change {
                id: id_of(journal, "id"),
                count: parsed.changes.len() as u64 + 1,
                creator,
                created,
                changes,
            });
        }
    }
    number_comments(&mut parsed.comments, 1);
    parsed
}

fn attachments(attachments: &Value) -> Vec<Attachment> {
    attachments
        .as_array()
        .into_iter()
        .flatten()
        .map(|a| {
            let mut attachment = Attachment::new(id_of(a, "id"), &string(a, "filename").unwrap_or_default());
            attachment.size = a["filesize"].as_u64();
            attachment.mimetype = string(a, "content_type");
            attachment.creator = string(&a["author"], "name");
            attachment.created = parse_time(&a["created_on"]);
            attachment.url = string(a, "content_url");
            attachment
        })
        .collect()
}

impl Tracker for Redmine {
    fn kind(&self) -> ServiceKind {
        ServiceKind::Redmine
    }

    fn api_root(&self) -> &str {
        &self.base
    }

    fn default_max_results(&self) -> usize {
        MAX_RESULTS
    }

    fn inject_auth(
        &self,
        config: &ServiceConfig,
        token: Option<&str>,
        _params: &mut Params,
        headers: &mut Vec<(String, String)>,
    ) {
        match token {
            Some(key) => headers.push(("X-Redmine-API-Key".to_string(), key.to_string())),
            None => {
                if let Some(credentials) = config.credentials() {
                    headers.push(("Authorization".to_string(), credentials.header_value()));
                }
            }
        }
    }

    fn failure(&self, response: &RawResponse) -> Option<Error> {
        match response.status {
            401 | 403 => Some(auth_failure(response, None)),
            422 => {
                let errors: Vec<String> = error_body(response)?["errors"]
                    .as_array()?
                    .iter()
                    .filter_map(|e| e.as_str().map(str::to_string))
                    .collect();
                Some(self.service_error(Some(422), errors.join("; ")))
            }
            _ => None,
        }
    }

    fn get(&self, _service: &Service, ids: &[u64], options: GetOptions) -> Result<Request> {
        let mut include = Vec::new();
        if options.comments || options.changes {
            include.push("journals");
        }
        if options.attachments {
            include.push("attachments");
        }
        let this = self.clone();
        Ok(self.per_issue(ids, &include, move |issue| Record::from(this.item(issue, options))))
    }

    fn search(&self, service: &Service, query: &SearchQuery) -> Result<Request> {
        require_terms(query)?;

        let mut request = LeafRequest::get("/issues.json").param("sort", "id");
        if !query.terms.is_empty() {
            request = request.param("subject", format!("~{}", query.terms.join(" ")));
        }
        let status = match query.status.as_slice() {
            [] => "*".to_string(),
            [one] => one.clone(),
            many => many.join("|"),
        };
        request = request.param("status_id", status);
        if let Some(creator) = &query.creator {
            request = request.param("author_id", creator.as_str());
        }
        if let Some(owner) = &query.owner {
            request = request.param("assigned_to_id", owner.as_str());
        }
        if let Some(created) = &query.created {
            request = request.param("created_on", format!(">={}", created.format("%Y-%m-%d")));
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

        Ok(PagedRequest::new(request, Paging::offset("offset", "limit"))
            .limit(query.limit, service.max_results())
            .start(query.offset)
            .into())
    }

    fn comments(&self, _service: &Service, ids: &[u64]) -> Result<Request> {
        Ok(self.per_issue(ids, &["journals"], |issue| {
            Record::List(journals(&issue["journals"]).comments.into_iter().map(Record::Comment).collect())
        }))
    }

    fn attachments(&self, _service: &Service, ids: &[u64]) -> Result<Request> {
        Ok(self.per_issue(ids, &["attachments"], |issue| {
            Record::List(attachments(&issue["attachments"]).into_iter().map(Record::Attachment).collect())
        }))
    }

    fn changes(&self, _service: &Service, ids: &[u64]) -> Result<Request> {
        Ok(self.per_issue(ids, &["journals"], |issue| {
            Record::List(journals(&issue["journals"]).changes.into_iter().map(Record::Change).collect())
        }))
    }
}
