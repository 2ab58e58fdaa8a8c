mod allura;
mod bitbucket;
mod bugzilla;
mod github;
mod gitlab;
mod jira;
mod redmine;
mod trac;

pub use allura::Allura;
pub use bitbucket::Bitbucket;
pub use bugzilla::Bugzilla;
pub use github::Github;
pub use gitlab::Gitlab;
pub use jira::Jira;
pub use redmine::Redmine;
pub use trac::Trac;

use futures::{StreamExt, TryStreamExt, stream};
use serde_json::Value;
use url::Url;

use crate::config::ServiceConfig;
use crate::error::{Error, Result};
use crate::models::{Comment, SearchQuery, number_comments};
use crate::request::{CompositeRequest, Record, Request};

pub(crate) fn strings(value: &Value) -> Vec<String> {
    match value {
        Value::Array(items) => items
            .iter()
            .filter_map(|v| match v {
                Value::String(s) => Some(s.clone()),
                Value::Null => None,
                other => Some(other.to_string()),
            })
            .collect(),
        Value::String(s) if !s.is_empty() => vec![s.clone()],
        _ => Vec::new(),
    }
}

pub(crate) fn numbers(value: &Value) -> Vec<u64> {
    match value {
        Value::Array(items) => items
            .iter()
            .filter_map(|v| match v {
                Value::Number(n) => n.as_u64(),
                Value::String(s) => s.parse().ok(),
                _ => None,
            })
            .collect(),
        _ => Vec::new(),
    }
}

pub(crate) fn id_list(ids: &[u64]) -> Value {
    Value::from(ids.to_vec())
}

/// `scheme://host[:port]` of a URL.
pub(crate) fn origin(url: &Url) -> String {
    let mut origin = format!("{}://{}", url.scheme(), url.host_str().unwrap_or_default());
    if let Some(port) = url.port() {
        origin.push_str(&format!(":{}", port));
    }
    origin
}

/// The last `n` path segments of the base URL, e.g. owner and repo.
pub(crate) fn trailing_segments(config: &ServiceConfig, n: usize) -> Result<Vec<String>> {
    let url = config.url()?;
    let segments: Vec<String> = url
        .path_segments()
        .map(|s| s.filter(|p| !p.is_empty()).map(str::to_string).collect())
        .unwrap_or_default();
    if segments.len() < n {
        return Err(Error::Config(format!(
            "{} URL needs {} path components: {}",
            config.kind, n, config.base
        )));
    }
    Ok(segments[segments.len() - n..].to_vec())
}

pub(crate) fn require_terms(query: &SearchQuery) -> Result<()> {
    if query.is_empty() {
        return Err(Error::Usage(
            "no supported search terms or options specified".to_string(),
        ));
    }
    Ok(())
}

/// Description lines for the common search options.
pub(crate) fn search_options(query: &SearchQuery) -> Vec<String> {
    let mut options = Vec::new();
    if !query.terms.is_empty() {
        options.push(format!("Summary: {}", query.terms.join(", ")));
    }
    if !query.status.is_empty() {
        options.push(format!("Status: {}", query.status.join(", ")));
    }
    if let Some(creator) = &query.creator {
        options.push(format!("Creator: {}", creator));
    }
    if let Some(owner) = &query.owner {
        options.push(format!("Owner: {}", owner));
    }
    if let Some(created) = &query.created {
        options.push(format!("Created: since {}", created.to_rfc3339()));
    }
    options
}

/// Gathers every comment a (usually paged) child yields into one list,
/// numbered from 1 in arrival order.
pub(crate) fn numbered(child: Request) -> CompositeRequest {
    CompositeRequest::new(vec![child], |_, streams| {
        stream::once(async move {
            let records: Vec<Record> = stream::iter(streams).flatten().try_collect().await?;
            let mut comments: Vec<Comment> = records
                .into_iter()
                .filter_map(|record| match record {
                    Record::Comment(comment) => Some(comment),
                    _ => None,
                })
                .collect();
            number_comments(&mut comments, 1);
            Ok(Record::List(comments.into_iter().map(Record::Comment).collect()))
        })
        .boxed()
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::service::ServiceKind;
    use serde_json::json;

    #[test]
    fn test_trailing_segments() {
        let config = ServiceConfig::new("https://github.com/owner/repo/", ServiceKind::Github).unwrap();
        assert_eq!(trailing_segments(&config, 2).unwrap(), vec!["owner", "repo"]);

        let config = ServiceConfig::new("https://github.com/owner", ServiceKind::Github).unwrap();
        assert!(matches!(trailing_segments(&config, 2), Err(Error::Config(_))));
    }

    #[test]
    fn test_origin_keeps_port() {
        let url = Url::parse("http://127.0.0.1:8080/a/b").unwrap();
        assert_eq!(origin(&url), "http://127.0.0.1:8080");
    }

    #[test]
    fn test_value_helpers() {
        assert_eq!(strings(&json!(["a", 1, null])), vec!["a", "1"]);
        assert_eq!(numbers(&json!([1, "2", "x"])), vec![1, 2]);
        assert_eq!(id_list(&[3, 4]), json!([3, 4]));
    }
}
