use serde_json::Value;

use super::{numbered, origin, require_terms, search_options, trailing_segments};
use crate::config::ServiceConfig;
use crate::error::Result;
use crate::models::{
    Attachment, Comment, GetOptions, Item, SearchQuery, id_of, number_comments, parse_time, string,
    with_description,
};
use crate::request::{
    CompositeRequest, LeafRequest, PagedRequest, Paging, Record, Request, TotalSource, nonexistent_hook,
};
use crate::service::{Service, ServiceKind, Tracker};

const MAX_RESULTS: usize = 100;

/// Allura (SourceForge) tickets, `https://<host>/p/<project>/<tracker>`.
#[derive(Debug, Clone)]
pub struct Allura {
    base: String,
    api: String,
}

impl Allura {
    pub fn new(config: &ServiceConfig) -> Result<Self> {
        let url = config.url()?;
        let segments = trailing_segments(config, 2)?;
        Ok(Self {
            base: config.base.clone(),
            api: format!("{}/rest/p/{}/{}", origin(&url), segments[0], segments[1]),
        })
    }

    fn item(&self, ticket: &Value, options: GetOptions) -> Item {
        let mut item = Item::new(id_of(ticket, "ticket_num").unwrap_or_default());
        item.title = string(ticket, "summary");
        item.creator = string(ticket, "reported_by");
        item.owner = string(ticket, "assigned_to").filter(|s| !s.is_empty());
        item.created = parse_time(&ticket["created_date"]);
        item.modified = parse_time(&ticket["mod_date"]);
        item.status = string(ticket, "status");
        item.url = Some(format!("{}/{}/", self.base, item.id));
        item.description = string(ticket, "description").filter(|s| !s.is_empty());
        if let Some(labels) = ticket.get("labels").filter(|l| l.as_array().is_some_and(|a| !a.is_empty())) {
            item.fields.insert("labels".to_string(), labels.clone());
        }
        if let Some(thread) = string(&ticket["discussion_thread"], "_id") {
            item.fields.insert("thread".to_string(), Value::from(thread));
        }

        if options.comments {
            let posts = posts(&ticket["discussion_thread"]["posts"]);
            item.comments = with_description(item.description_comment(), posts);
        }
        if options.attachments {
            item.attachments = ticket["attachments"]
                .as_array()
                .into_iter()
                .flatten()
                .map(|a| {
                    let url = string(a, "url").unwrap_or_default();
                    let name = url.trim_end_matches('/').rsplit('/').next().unwrap_or_default().to_string();
                    let mut attachment = Attachment::new(None, &name);
                    attachment.size = a["bytes"].as_u64();
                    attachment.url = Some(url);
                    attachment
                })
                .collect();
        }
        item
    }

    fn per_ticket<F>(&self, ids: &[u64], parse: F) -> Request
    where
        F: Fn(&Value) -> Record + Clone + Send + Sync + 'static,
    {
        let children = ids
            .iter()
            .map(|id| {
                let parse = parse.clone();
                LeafRequest::get(format!("/{}", id))
                    .parser(move |reply| Ok(vec![parse(&reply.data["ticket"])]))
                    .on_error(nonexistent_hook(&[*id]))
                    .into()
            })
            .collect();
        CompositeRequest::group(children).into()
    }

    /// Every post of a discussion thread, numbered from 1.
    ///
    /// Threads report no total, so pages are requested until one comes back
    /// empty.
    pub fn thread(&self, service: &Service, thread_id: &str, limit: Option<usize>) -> Request {
        let page = LeafRequest::get(format!("/_discuss/thread/{}", thread_id))
            .parser(|reply| {
                let posts = reply.data["thread"]["posts"].as_array().cloned().unwrap_or_default();
                Ok(posts.iter().map(|p| Record::Comment(post(p))).collect())
            })
            .many();
        let paged = PagedRequest::new(page, Paging::flag("page", "limit", 0)).limit(limit, service.max_results());
        numbered(paged.into()).into()
    }
}

fn post(value: &Value) -> Comment {
    Comment {
        id: None,
        count: 0,
        creator: string(value, "author"),
        created: parse_time(&value["timestamp"]),
        text: string(value, "text").unwrap_or_default(),
    }
}

fn posts(list: &Value) -> Vec<Comment> {
    let mut comments: Vec<Comment> = list.as_array().into_iter().flatten().map(post).collect();
    number_comments(&mut comments, 1);
    comments
}

impl Tracker for Allura {
    fn kind(&self) -> ServiceKind {
        ServiceKind::Allura
    }

    fn api_root(&self) -> &str {
        &self.api
    }

    fn default_max_results(&self) -> usize {
        MAX_RESULTS
    }

    fn get(&self, _service: &Service, ids: &[u64], options: GetOptions) -> Result<Request> {
        let this = self.clone();
        Ok(self.per_ticket(ids, move |ticket| Record::from(this.item(ticket, options))))
    }

    fn search(&self, service: &Service, query: &SearchQuery) -> Result<Request> {
        require_terms(query)?;

        let mut clauses = Vec::new();
        for term in &query.terms {
            clauses.push(format!("summary:{}", term));
        }
        if !query.status.is_empty() {
            clauses.push(format!("status:({})", query.status.join(" OR ")));
        }
        if let Some(creator) = &query.creator {
            clauses.push(format!("reported_by:{}", creator));
        }
        if let Some(owner) = &query.owner {
            clauses.push(format!("assigned_to:{}", owner));
        }
        if let Some(created) = &query.created {
            clauses.push(format!("created_date:[{} TO NOW]", created.format("%Y-%m-%dT%H:%M:%SZ")));
        }

        let mut request = LeafRequest::get("/search").param("q", clauses.join(" AND "));
        for option in search_options(query) {
            request.push_option(option);
        }
        let this = self.clone();
        let request = request
            .parser(move |reply| {
                let tickets = reply.data["tickets"].as_array().cloned().unwrap_or_default();
                Ok(tickets
                    .iter()
                    .map(|t| Record::from(this.item(t, GetOptions::new())))
                    .collect())
            })
            .many();

        let paging = Paging::page("page", "limit", 0, Some(TotalSource::Body("count".to_string())))?;
        Ok(PagedRequest::new(request, paging)
            .limit(query.limit, service.max_results())
            .start(query.page)
            .into())
    }

    fn comments(&self, _service: &Service, ids: &[u64]) -> Result<Request> {
        Ok(self.per_ticket(ids, |ticket| {
            Record::List(posts(&ticket["discussion_thread"]["posts"]).into_iter().map(Record::Comment).collect())
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_api_root() {
        let config = ServiceConfig::new("https://sourceforge.net/p/proj/tickets", ServiceKind::Allura).unwrap();
        let allura = Allura::new(&config).unwrap();
        assert_eq!(allura.api_root(), "https://sourceforge.net/rest/p/proj/tickets");
    }

    #[test]
    fn test_ticket_with_posts() {
        let config = ServiceConfig::new("https://sourceforge.net/p/proj/bugs", ServiceKind::Allura).unwrap();
        let allura = Allura::new(&config).unwrap();
        let ticket = json!({
            "ticket_num": 12,
            "summary": "Hang",
            "reported_by": "alice",
            "description": "hangs on exit",
            "discussion_thread": {"_id": "abc", "posts": [
                {"author": "bob", "text": "same here", "timestamp": "2024-01-01 10:00:00"}
            ]},
            "attachments": [{"url": "https://sourceforge.net/p/proj/bugs/12/attachment/log.txt", "bytes": 12}]
        });

        let item = allura.item(&ticket, GetOptions::all());

        assert_eq!(item.url.as_deref(), Some("https://sourceforge.net/p/proj/bugs/12/"));
        assert_eq!(item.fields["thread"], "abc");
        let counts: Vec<u64> = item.comments.iter().map(|c| c.count).collect();
        assert_eq!(counts, vec![0, 1]);
        assert_eq!(item.attachments[0].filename, "log.txt");
    }
}
