use serde_json::Value;

use super::{numbered, origin, require_terms, search_options};
use crate::config::ServiceConfig;
use crate::error::{Error, Result};
use crate::http::RawResponse;
use crate::models::{Comment, GetOptions, Item, SearchQuery, id_of, parse_time, string};
use crate::request::{
    CompositeRequest, LeafRequest, LinkSource, NullRequest, PagedRequest, Paging, Params, Record,
    Request, TotalSource, nonexistent_hook,
};
use crate::service::tracker::{auth_failure, error_body};
use crate::service::{Service, ServiceKind, Tracker};

const MAX_RESULTS: usize = 100;

/// GitLab project issues, `https://gitlab.example.org/<group>/<project>`.
///
/// Items are addressed by their project-local IID.
#[derive(Debug, Clone)]
pub struct Gitlab {
    host: String,
    api: String,
}

impl Gitlab {
    pub fn new(config: &ServiceConfig) -> Result<Self> {
        let url = config.url()?;
        let path = url.path().trim_matches('/');
        if !path.contains('/') {
            return Err(Error::Config(format!(
                "gitlab URL must name a project: {}",
                config.base
            )));
        }
        let host = origin(&url);
        Ok(Self {
            api: format!("{}/api/v4/projects/{}", host, urlencoding::encode(path)),
            host,
        })
    }

    fn issue_request(&self, id: u64) -> LeafRequest {
        LeafRequest::get(format!("/issues/{}", id))
            .parser(|reply| Ok(vec![Record::from(item(&reply.data))]))
            .on_error(nonexistent_hook(&[id]))
    }

    fn notes_request(&self, id: u64) -> Request {
        let page = LeafRequest::get(format!("/issues/{}/notes", id))
            .param("sort", "asc")
            .param("order_by", "created_at")
            .parser(|reply| {
                let notes = reply.data.as_array().cloned().unwrap_or_default();
                Ok(notes
                    .iter()
                    // system notes record state changes, not discussion
                    .filter(|n| !n["system"].as_bool().unwrap_or(false))
                    .map(|n| Record::Comment(note(n)))
                    .collect())
            })
            .many();
        let paged = PagedRequest::new(page, Paging::link(Some("per_page"), LinkSource::Header));
        numbered(paged.into()).on_error(nonexistent_hook(&[id])).into()
    }
}

fn username(user: &Value) -> Option<String> {
    string(user, "username")
}

fn item(issue: &Value) -> Item {
    let mut item = Item::new(id_of(issue, "iid").unwrap_or_default());
    item.title = string(issue, "title");
    item.creator = username(&issue["author"]);
    item.owner = username(&issue["assignee"]);
    item.created = parse_time(&issue["created_at"]);
    item.modified = parse_time(&issue["updated_at"]);
    item.status = string(issue, "state");
    item.url = string(issue, "web_url");
    item.description = string(issue, "description").filter(|s| !s.is_empty());
    if let Some(labels) = issue.get("labels").filter(|l| l.as_array().is_some_and(|a| !a.is_empty())) {
        item.fields.insert("labels".to_string(), labels.clone());
    }
    item
}

fn note(value: &Value) -> Comment {
    Comment {
        id: id_of(value, "id"),
        count: 0,
        creator: username(&value["author"]),
        created: parse_time(&value["created_at"]),
        text: string(value, "body").unwrap_or_default(),
    }
}

impl Tracker for Gitlab {
    fn kind(&self) -> ServiceKind {
        ServiceKind::Gitlab
    }

    fn api_root(&self) -> &str {
        &self.api
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
            Some(token) => headers.push(("PRIVATE-TOKEN".to_string(), token.to_string())),
            None => {
                if let Some(credentials) = config.credentials() {
                    headers.push(("Authorization".to_string(), credentials.header_value()));
                }
            }
        }
    }

    fn failure(&self, response: &RawResponse) -> Option<Error> {
        let body = error_body(response)?;
        let msg = string(&body, "message").or_else(|| string(&body, "error"))?;
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
        let notes: Request = if options.comments {
            CompositeRequest::group(ids.iter().map(|id| self.notes_request(*id)).collect()).into()
        } else {
            NullRequest::new().into()
        };

        Ok(CompositeRequest::assemble(vec![CompositeRequest::group(items).into(), notes], options.comments).into())
    }

    fn search(&self, service: &Service, query: &SearchQuery) -> Result<Request> {
        require_terms(query)?;

        let mut request = LeafRequest::get("/issues");
        if !query.terms.is_empty() {
            request = request.param("search", query.terms.join(" ")).param("in", "title");
        }
        if let [status] = query.status.as_slice() {
            request = request.param("state", status.as_str());
        }
        if let Some(creator) = &query.creator {
            request = request.param("author_username", creator.as_str());
        }
        if let Some(owner) = &query.owner {
            request = request.param("assignee_username", owner.as_str());
        }
        if let Some(created) = &query.created {
            request = request.param("created_after", created.to_rfc3339());
        }
        for option in search_options(query) {
            request.push_option(option);
        }
        let request = request
            .parser(|reply| {
                let issues = reply.data.as_array().cloned().unwrap_or_default();
                Ok(issues.iter().map(|issue| Record::from(item(issue))).collect())
            })
            .many();

        let paging = Paging::page("page", "per_page", 1, Some(TotalSource::Header("X-Total".to_string())))?;
        Ok(PagedRequest::new(request, paging)
            .limit(query.limit, service.max_results())
            .start(query.page)
            .into())
    }

    fn comments(&self, _service: &Service, ids: &[u64]) -> Result<Request> {
        Ok(CompositeRequest::group(ids.iter().map(|id| self.notes_request(*id)).collect()).into())
    }

    fn version(&self, _service: &Service) -> Result<Request> {
        Ok(LeafRequest::get(format!("{}/api/v4/version", self.host))
            .parser(|reply| Ok(vec![Record::Value(reply.data["version"].clone())]))
            .into())
    }
}
