use serde_json::Value;
use tracing::{debug, warn};

use super::{LeafRequest, Record, RequestNode};
use crate::Service;
use crate::error::{Error, Result};
use crate::http::{HttpRequest, Reply};

/// Where the expected result total comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TotalSource {
    Body(String),
    Header(String),
}

/// Where the next page reference comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkSource {
    Body(String),
    /// `Link: <...>; rel="next"`
    Header,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Paging {
    /// Offset and limit; a short page means the end.
    Offset { offset_key: String, size_key: String },
    /// Page number with a known total.
    Page {
        page_key: String,
        size_key: String,
        start: u64,
        total: TotalSource,
    },
    /// Page number until an empty page comes back.
    Flag {
        page_key: String,
        size_key: String,
        start: u64,
    },
    /// Opaque next link, followed verbatim.
    Link {
        size_key: Option<String>,
        next: LinkSource,
    },
}

impl Paging {
    pub fn offset(offset_key: &str, size_key: &str) -> Self {
        Paging::Offset {
            offset_key: offset_key.to_string(),
            size_key: size_key.to_string(),
        }
    }

    /// Page-number paging needs the service to report a total.
    pub fn page(page_key: &str, size_key: &str, start: u64, total: Option<TotalSource>) -> Result<Self> {
        let total = total.ok_or_else(|| {
            Error::Config(format!(
                "page paging on '{}' requires a result total; use flag or link paging",
                page_key
            ))
        })?;
        Ok(Paging::Page {
            page_key: page_key.to_string(),
            size_key: size_key.to_string(),
            start,
            total,
        })
    }

    pub fn flag(page_key: &str, size_key: &str, start: u64) -> Self {
        Paging::Flag {
            page_key: page_key.to_string(),
            size_key: size_key.to_string(),
            start,
        }
    }

    pub fn link(size_key: Option<&str>, next: LinkSource) -> Self {
        Paging::Link {
            size_key: size_key.map(str::to_string),
            next,
        }
    }

    fn size_key(&self) -> Option<&str> {
        match self {
            Paging::Offset { size_key, .. }
            | Paging::Page { size_key, .. }
            | Paging::Flag { size_key, .. } => Some(size_key),
            Paging::Link { size_key, .. } => size_key.as_deref(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageState {
    AwaitingFirstPage,
    PageIssued(u32),
    Exhausted,
}

/// Cursor data read from a page before its records are parsed.
#[derive(Debug, Default)]
struct PageMeta {
    total: Option<usize>,
    next: Option<String>,
}

/// A leaf request that keeps re-issuing itself until its paging rule says
/// the results are exhausted.
pub struct PagedRequest {
    leaf: LeafRequest,
    paging: Paging,
    state: PageState,
    seen: usize,
    prev_seen: usize,
    total: Option<usize>,
    limit: Option<usize>,
    page: u64,
    /// Pages before a caller-supplied start page.
    skipped_pages: u64,
    initial_offset: usize,
}

impl PagedRequest {
    pub fn new(mut leaf: LeafRequest, paging: Paging) -> Self {
        let page = match &paging {
            Paging::Page { page_key, start, .. } | Paging::Flag { page_key, start, .. } => {
                leaf.params_mut().insert(page_key.clone(), Value::from(*start));
                *start
            }
            _ => 0,
        };
        Self {
            leaf,
            paging,
            state: PageState::AwaitingFirstPage,
            seen: 0,
            prev_seen: 0,
            total: None,
            limit: None,
            page,
            skipped_pages: 0,
            initial_offset: 0,
        }
    }

    /// Caps the number of results, using it as the page size unless the
    /// service allows fewer per page.
    pub fn limit(mut self, limit: Option<usize>, max_page: usize) -> Self {
        let Some(limit) = limit else {
            return self;
        };
        self.limit = Some(limit);
        let size = if max_page > 0 { limit.min(max_page) } else { limit };
        if let Some(key) = self.paging.size_key() {
            self.leaf.params_mut().insert(key.to_string(), Value::from(size));
        }
        self.leaf.push_option(format!("Limit: {}", limit));
        self
    }

    /// Starting page number or offset requested by the caller.
    pub fn start(mut self, start: Option<u64>) -> Self {
        let Some(start) = start else {
            return self;
        };
        match &self.paging {
            Paging::Page { page_key, start: first, .. } | Paging::Flag { page_key, start: first, .. } => {
                let key = page_key.clone();
                self.skipped_pages = start.saturating_sub(*first);
                self.page = start;
                self.leaf.params_mut().insert(key, Value::from(start));
                self.leaf.push_option(format!("Page: {}", start));
            }
            Paging::Offset { offset_key, .. } => {
                let key = offset_key.clone();
                self.initial_offset = start as usize;
                self.leaf.params_mut().insert(key, Value::from(start));
                self.leaf.push_option(format!("Offset: {}", start));
            }
            Paging::Link { .. } => {}
        }
        self
    }

    pub fn state(&self) -> PageState {
        self.state
    }

    pub fn seen(&self) -> usize {
        self.seen
    }

    pub fn leaf(&self) -> &LeafRequest {
        &self.leaf
    }

    pub fn prepared(&self) -> Result<&HttpRequest> {
        self.leaf.prepared()
    }

    fn page_size(&self) -> Option<usize> {
        let key = self.paging.size_key()?;
        match self.leaf.params().get(key)? {
            Value::Number(n) => n.as_u64().map(|n| n as usize),
            Value::String(s) => s.parse().ok(),
            _ => None,
        }
    }

    fn meta(&self, reply: &Reply) -> PageMeta {
        let count = |value: &Value| match value {
            Value::Number(n) => n.as_u64().map(|n| n as usize),
            Value::String(s) => s.parse().ok(),
            _ => None,
        };
        let total = match &self.paging {
            Paging::Page { total: TotalSource::Body(key), .. } => reply.data.get(key).and_then(count),
            Paging::Page { total: TotalSource::Header(name), .. } => {
                reply.header(name).and_then(|v| v.trim().parse().ok())
            }
            _ => None,
        };
        let next = match &self.paging {
            Paging::Link { next: LinkSource::Body(key), .. } => reply
                .data
                .get(key)
                .and_then(Value::as_str)
                .filter(|s| !s.is_empty())
                .map(str::to_string),
            Paging::Link { next: LinkSource::Header, .. } => reply.next_link.clone(),
            _ => None,
        };
        PageMeta { total, next }
    }

    /// Parses one page and advances the cursor.
    ///
    /// Returns the page's records and whether another page should be
    /// requested.
    pub fn next_page(&mut self, reply: Reply) -> Result<(Vec<Record>, bool)> {
        let meta = self.meta(&reply);
        let mut records = self.leaf.parse(reply)?;
        let returned = records.len();

        if let Some(limit) = self.limit {
            records.truncate(limit.saturating_sub(self.seen));
        }
        self.seen += records.len();

        let more = self.limit.is_none_or(|limit| self.seen < limit) && self.advance(meta, returned);
        self.state = match (more, self.state) {
            (false, _) => PageState::Exhausted,
            (true, PageState::PageIssued(n)) => PageState::PageIssued(n + 1),
            (true, _) => PageState::PageIssued(2),
        };
        if more {
            self.leaf.reset();
            debug!(seen = self.seen, state = ?self.state, "requesting next page");
        }
        Ok((records, more))
    }

    fn advance(&mut self, meta: PageMeta, returned: usize) -> bool {
        match &self.paging {
            Paging::Offset { offset_key, .. } => {
                let since_prev = self.seen - self.prev_seen;
                let full = self.page_size().is_some_and(|size| returned >= size && size > 0);
                if !full || since_prev == 0 {
                    return false;
                }
                let key = offset_key.clone();
                self.prev_seen = self.seen;
                let offset = self.initial_offset + self.seen;
                self.leaf.params_mut().insert(key, Value::from(offset));
                true
            }
            Paging::Page { page_key, .. } => {
                if meta.total.is_some() {
                    self.total = meta.total;
                }
                let Some(total) = self.total else {
                    warn!("service did not report a result total, stopping");
                    return false;
                };
                // the total counts results on skipped pages too
                let skipped = self.skipped_pages as usize * self.page_size().unwrap_or(0);
                if skipped + self.seen >= total || returned == 0 {
                    return false;
                }
                let key = page_key.clone();
                self.page += 1;
                self.leaf.params_mut().insert(key, Value::from(self.page));
                true
            }
            Paging::Flag { page_key, .. } => {
                if returned == 0 {
                    return false;
                }
                let key = page_key.clone();
                self.page += 1;
                self.leaf.params_mut().insert(key, Value::from(self.page));
                true
            }
            Paging::Link { .. } => match meta.next {
                Some(next) => {
                    self.leaf.follow(next);
                    true
                }
                None => false,
            },
        }
    }
}

impl RequestNode for PagedRequest {
    type Input = Reply;
    type Output = Vec<Record>;

    fn options(&self) -> Vec<String> {
        self.leaf.options()
    }

    fn finalize(&mut self, service: &Service) -> Result<()> {
        if !self.leaf.is_finalized() {
            if let Some(key) = self.paging.size_key() {
                let max = service.max_results();
                if max > 0 && !self.leaf.params().contains_key(key) {
                    let key = key.to_string();
                    self.leaf.params_mut().insert(key, Value::from(max));
                }
            }
        }
        self.leaf.finalize(service)
    }

    fn prepare(&mut self, service: &Service) -> Result<Vec<HttpRequest>> {
        self.finalize(service)?;
        Ok(vec![self.leaf.prepared()?.clone()])
    }

    fn parse(&self, reply: Reply) -> Result<Vec<Record>> {
        self.leaf.parse(reply)
    }

    fn handle_exception(&self, err: Error) -> Error {
        self.leaf.handle_exception(err)
    }
}
