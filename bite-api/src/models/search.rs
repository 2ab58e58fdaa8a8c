use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct SearchQuery {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub terms: Vec<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub status: Vec<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub creator: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub owner: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub created: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub fields: Vec<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub limit: Option<usize>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub page: Option<u64>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub offset: Option<u64>,
}

impl SearchQuery {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn terms(mut self, terms: Vec<String>) -> Self {
        self.terms = terms;
        self
    }

    pub fn status(mut self, status: Vec<String>) -> Self {
        self.status = status;
        self
    }

    pub fn creator(mut self, creator: impl Into<String>) -> Self {
        self.creator = Some(creator.into());
        self
    }

    pub fn owner(mut self, owner: impl Into<String>) -> Self {
        self.owner = Some(owner.into());
        self
    }

    pub fn created(mut self, since: DateTime<Utc>) -> Self {
        self.created = Some(since);
        self
    }

    pub fn fields(mut self, fields: Vec<String>) -> Self {
        self.fields = fields;
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn page(mut self, page: u64) -> Self {
        self.page = Some(page);
        self
    }

    pub fn offset(mut self, offset: u64) -> Self {
        self.offset = Some(offset);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.terms.is_empty()
            && self.status.is_empty()
            && self.creator.is_none()
            && self.owner.is_none()
            && self.created.is_none()
    }
}

/// Which optional parts of an item to fetch alongside it.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GetOptions {
    pub comments: bool,
    pub attachments: bool,
    pub changes: bool,
}

impl GetOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn all() -> Self {
        Self {
            comments: true,
            attachments: true,
            changes: true,
        }
    }

    pub fn comments(mut self, comments: bool) -> Self {
        self.comments = comments;
        self
    }

    pub fn attachments(mut self, attachments: bool) -> Self {
        self.attachments = attachments;
        self
    }

    pub fn changes(mut self, changes: bool) -> Self {
        self.changes = changes;
        self
    }
}
