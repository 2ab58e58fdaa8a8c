use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Comment {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<u64>,

    pub count: u64,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub creator: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub created: Option<DateTime<Utc>>,

    pub text: String,
}

impl Comment {
    pub fn is_description(&self) -> bool {
        self.count == 0
    }
}

/// Numbers comments consecutively from `start` in their current order.
pub fn number_comments(comments: &mut [Comment], start: u64) {
    for (count, comment) in (start..).zip(comments.iter_mut()) {
        comment.count = count;
    }
}

/// Prepends a locally synthesized description (comment #0) to comments
/// the server numbered from 1.
pub fn with_description(description: Option<Comment>, comments: Vec<Comment>) -> Vec<Comment> {
    match description {
        Some(mut description) => {
            description.count = 0;
            let mut all = Vec::with_capacity(comments.len() + 1);
            all.push(description);
            all.extend(comments.into_iter().filter(|c| c.count != 0));
            all
        }
        None => comments,
    }
}
