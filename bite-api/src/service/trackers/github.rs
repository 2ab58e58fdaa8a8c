use serde_json::Value;

use super::{numbered, origin, require_terms, search_options, trailing_segments};
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

/// GitHub issues of one repository, `https://github.com/<owner>/<repo>`.
#[derive(Debug, Clone)]
pub struct Github {
    api_host: String,
    api: String,
    repo: String,
}

impl Github {
    pub fn new(config: &ServiceConfig) -> Result<Self> {
        let url = config.url()?;
        let segments = trailing_segments(config, 2)?;
        let api_host = match url.host_str() {
            Some("github.com") | Some("www.github.com") => "https://api.github.com".to_string(),
            _ => origin(&url),
        };
        let repo = segments.join("/");
        Ok(Self {
            api: format!("{}/repos/{}", api_host, repo),
            api_host,
            repo,
        })
    }

    fn issue_request(&self, id: u64) -> LeafRequest {
        LeafRequest::get(format!("/issues/{}", id))
            .parser(|reply| Ok(vec![Record::from(item(&reply.data))]))
            .on_error(nonexistent_hook(&[id]))
    }

    fn comments_request(&self, id: u64) -> Request {
        let page = LeafRequest::get(format!("/issues/{}/comments", id))
            .parser(|reply| {
                let comments = reply.data.as_array().cloned().unwrap_or_default();
                Ok(comments.iter().map(|c| Record::Comment(comment(c))).collect())
            })
            .many();
        let paged = PagedRequest::new(page, Paging::link(Some("per_page"), LinkSource::Header));
        numbered(paged.into()).on_error(nonexistent_hook(&[id])).into()
    }

    fn query(&self, query: &SearchQuery) -> String {
        let mut q = vec![format!("repo:{}", self.repo), "is:issue".to_string()];
        q.extend(query.terms.iter().cloned());
        // open and closed both match unless exactly one state is asked for
        if let [status] = query.status.as_slice() {
            q.push(format!("state:{}", status));
        }
        if let Some(creator) = &query.creator {
            q.push(format!("author:{}", creator));
        }
        if let Some(owner) = &query.owner {
            q.push(format!("assignee:{}", owner));
        }
        if let Some(created) = &query.created {
            q.push(format!("created:>={}", created.format("%Y-%m-%dT%H:%M:%SZ")));
        }
        q.join(" ")
    }
}

fn login(user: &Value) -> Option<String> {
    string(user, "login")
}

fn item(issue: &Value) -> Item {
    let mut item = Item::new(id_of(issue, "number").unwrap_or_default());
    item.title = string(issue, "title");
    item.creator = login(&issue["user"]);
    item.owner = login(&issue["assignee"]);
    item.created = parse_time(&issue["created_at"]);
    item.modified = parse_time(&issue["updated_at"]);
    item.status = string(issue, "state");
    item.url = string(issue, "html_url");
    item.description = string(issue, "body").filter(|s| !s.is_empty());
    let labels: Vec<Value> = issue["labels"]
        .as_array()
        .into_iter()
        .flatten()
        .filter_map(|l| l.get("name").cloned())
        .collect();
    if !labels.is_empty() {
        item.fields.insert("labels".to_string(), Value::from(labels));
    }
    if let Some(milestone) = string(&issue["milestone"], "title") {
        item.fields.insert("milestone".to_string(), Value::from(milestone));
    }
    item
}

fn comment(value: &Value) -> Comment {
    Comment {
        id: id_of(value, "id"),
        count: 0,
        creator: login(&value["user"]),
        created: parse_time(&value["created_at"]),
        text: string(value, "body").unwrap_or_default(),
    }
}

impl Tracker for Github {
    fn kind(&self) -> ServiceKind {
        ServiceKind::Github
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
        let value = match token {
            Some(token) => format!("token {}", token),
            None => match config.credentials() {
                Some(credentials) => credentials.header_value(),
                None => return,
            },
        };
        headers.push(("Authorization".to_string(), value));
    }

    fn failure(&self, response: &RawResponse) -> Option<Error> {
        let msg = string(&error_body(response)?, "message")?;
        match response.status {
            401 => Some(auth_failure(response, Some(&msg))),
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

        Ok(CompositeRequest::assemble(
            vec![CompositeRequest::group(items).into(), comments],
            options.comments,
        )
        .into())
    }

    fn search(&self, service: &Service, query: &SearchQuery) -> Result<Request> {
        require_terms(query)?;

        let mut request = LeafRequest::get(format!("{}/search/issues", self.api_host)).param("q", self.query(query));
        for option in search_options(query) {
            request.push_option(option);
        }
        let request = request
            .parser(|reply| {
                let issues = reply.data["items"].as_array().cloned().unwrap_or_default();
                Ok(issues.iter().map(|issue| Record::from(item(issue))).collect())
            })
            .many();

        let paging = Paging::page("page", "per_page", 1, Some(TotalSource::Body("total_count".to_string())))?;
        Ok(PagedRequest::new(request, paging)
            .limit(query.limit, service.max_results())
            .start(query.page)
            .into())
    }

    fn comments(&self, _service: &Service, ids: &[u64]) -> Result<Request> {
        Ok(CompositeRequest::group(ids.iter().map(|id| self.comments_request(*id)).collect()).into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use serde_json::json;

    #[test]
    fn test_api_root_for_public_and_enterprise_hosts() {
        let config = ServiceConfig::new("https://github.com/rust-lang/rust", ServiceKind::Github).unwrap();
        let github = Github::new(&config).unwrap();
        assert_eq!(github.api_root(), "https://api.github.com/repos/rust-lang/rust");

        let config = ServiceConfig::new("http://127.0.0.1:8080/owner/repo", ServiceKind::Github).unwrap();
        let github = Github::new(&config).unwrap();
        assert_eq!(github.api_root(), "http://127.0.0.1:8080/repos/owner/repo");
    }

    #[test]
    fn test_search_qualifiers() {
        let config = ServiceConfig::new("https://github.com/o/r", ServiceKind::Github).unwrap();
        let github = Github::new(&config).unwrap();
        let query = SearchQuery::new()
            .terms(vec!["panic".to_string()])
            .status(vec!["open".to_string()])
            .created(Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap());

        assert_eq!(
            github.query(&query),
            "repo:o/r is:issue panic state:open created:>=2024-01-01T00:00:00Z"
        );
    }

    #[test]
    fn test_token_auth_header() {
        let config = ServiceConfig::new("https://github.com/o/r", ServiceKind::Github).unwrap();
        let github = Github::new(&config).unwrap();
        let mut params = Params::new();
        let mut headers = Vec::new();

        github.inject_auth(&config, Some("ghp_abc"), &mut params, &mut headers);

        assert_eq!(headers, vec![("Authorization".to_string(), "token ghp_abc".to_string())]);
        assert!(params.is_empty());
    }

    #[test]
    fn test_issue_parsing() {
        let parsed = item(&json!({
            "number": 7,
            "title": "Crash on start",
            "user": {"login": "alice"},
            "state": "open",
            "body": "",
            "labels": [{"name": "bug"}],
            "created_at": "2024-02-03T04:05:06Z"
        }));
        assert_eq!(parsed.id, 7);
        assert_eq!(parsed.creator.as_deref(), Some("alice"));
        assert!(parsed.description.is_none());
        assert_eq!(parsed.fields["labels"], json!(["bug"]));
    }
}
