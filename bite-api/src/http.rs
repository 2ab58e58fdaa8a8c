use reqwest::header::HeaderMap;
use serde_json::Value;

use crate::error::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Get,
    Post,
    Put,
    Delete,
}

impl Method {
    pub fn as_str(&self) -> &'static str {
        match self {
            Method::Get => "GET",
            Method::Post => "POST",
            Method::Put => "PUT",
            Method::Delete => "DELETE",
        }
    }
}

impl From<Method> for reqwest::Method {
    fn from(method: Method) -> Self {
        match method {
            Method::Get => reqwest::Method::GET,
            Method::Post => reqwest::Method::POST,
            Method::Put => reqwest::Method::PUT,
            Method::Delete => reqwest::Method::DELETE,
        }
    }
}

/// A fully finalized physical request.
#[derive(Debug, Clone, PartialEq)]
pub struct HttpRequest {
    pub method: Method,
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub body: Option<String>,
}

impl HttpRequest {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

/// Undecoded response as handed back by the session.
#[derive(Debug, Clone)]
pub struct RawResponse {
    pub status: u16,
    pub reason: String,
    pub url: String,
    pub headers: HeaderMap,
    pub body: String,
}

impl RawResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    /// Generic classification of a failed response, used when a tracker
    /// has nothing more specific to say.
    pub fn error(&self) -> Error {
        match self.status {
            401 | 403 => Error::Auth {
                msg: "authentication failed".to_string(),
                code: Some(i64::from(self.status)),
                expired: self.body.to_lowercase().contains("expired"),
            },
            status => Error::Request {
                msg: format!("HTTP Error {}: {}", status, self.reason),
                code: Some(status),
                text: (!self.body.is_empty()).then(|| self.body.clone()),
            },
        }
    }
}

/// Decoded response data plus the bits paging needs.
#[derive(Debug, Clone, Default)]
pub struct Reply {
    pub data: Value,
    pub headers: HeaderMap,
    pub next_link: Option<String>,
}

impl Reply {
    pub fn new(data: Value) -> Self {
        Self {
            data,
            ..Default::default()
        }
    }

    pub fn with_headers(data: Value, headers: HeaderMap) -> Self {
        let next_link = headers
            .get(reqwest::header::LINK)
            .and_then(|v| v.to_str().ok())
            .and_then(next_link);
        Self {
            data,
            headers,
            next_link,
        }
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }
}

/// Extracts the `rel="next"` target from a `Link` header.
pub fn next_link(header: &str) -> Option<String> {
    header.split(',').find_map(|part| {
        let mut pieces = part.split(';');
        let target = pieces.next()?.trim();
        let is_next = pieces.any(|p| {
            let p = p.trim().replace(' ', "");
            p == "rel=\"next\"" || p == "rel=next"
        });
        if is_next && target.starts_with('<') && target.ends_with('>') {
            Some(target[1..target.len() - 1].to_string())
        } else {
            None
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_next_link_parsing() {
        let header = r#"<https://api.example.com/issues?page=2>; rel="next", <https://api.example.com/issues?page=5>; rel="last""#;
        assert_eq!(
            next_link(header).as_deref(),
            Some("https://api.example.com/issues?page=2")
        );

        let last_page = r#"<https://api.example.com/issues?page=1>; rel="first", <https://api.example.com/issues?page=4>; rel="prev""#;
        assert_eq!(next_link(last_page), None);
    }

    #[test]
    fn test_failed_response_classification() {
        let response = RawResponse {
            status: 401,
            reason: "Unauthorized".to_string(),
            url: "https://example.org".to_string(),
            headers: HeaderMap::new(),
            body: "Your token has Expired".to_string(),
        };
        assert!(response.error().is_expired_auth());

        let response = RawResponse {
            status: 500,
            reason: "Internal Server Error".to_string(),
            body: String::new(),
            ..response
        };
        match response.error() {
            Error::Request { msg, code, text } => {
                assert_eq!(msg, "HTTP Error 500: Internal Server Error");
                assert_eq!(code, Some(500));
                assert_eq!(text, None);
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }
}
