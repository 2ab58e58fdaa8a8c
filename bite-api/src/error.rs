use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("{0}")]
    Usage(String),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("{msg}")]
    Request {
        msg: String,
        code: Option<u16>,
        text: Option<String>,
    },

    #[error("service moved permanently: {old} -> {new}")]
    Moved { old: String, new: String },

    #[error("{msg}")]
    Auth {
        msg: String,
        code: Option<i64>,
        expired: bool,
    },

    #[error("{msg}")]
    Parsing { msg: String, text: Option<String> },

    #[error("{service} error: {msg}")]
    Service {
        service: String,
        msg: String,
        code: Option<i64>,
    },

    #[error("multicall item {index} failed: {source}")]
    MulticallFault {
        index: usize,
        #[source]
        source: Box<Error>,
    },

    #[error("nonexistent item ID(s): {}", join_ids(.ids))]
    NonexistentItem { ids: Vec<u64> },

    #[error("unsupported operation: {0}")]
    Unsupported(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("unexpected error: {0}")]
    Unexpected(String),
}

pub type Result<T> = std::result::Result<T, Error>;

fn join_ids(ids: &[u64]) -> String {
    ids.iter().map(u64::to_string).collect::<Vec<_>>().join(", ")
}

impl Error {
    pub fn request(msg: impl Into<String>) -> Self {
        Error::Request {
            msg: msg.into(),
            code: None,
            text: None,
        }
    }

    pub fn auth(msg: impl Into<String>) -> Self {
        Error::Auth {
            msg: msg.into(),
            code: None,
            expired: false,
        }
    }

    pub fn expired(msg: impl Into<String>) -> Self {
        Error::Auth {
            msg: msg.into(),
            code: None,
            expired: true,
        }
    }

    pub fn parsing(msg: impl Into<String>) -> Self {
        Error::Parsing {
            msg: msg.into(),
            text: None,
        }
    }

    /// Renders the message shown to users. Raw server text is only
    /// appended in verbose mode.
    pub fn message(&self, verbose: bool) -> String {
        match self {
            Error::Request {
                text: Some(text), ..
            }
            | Error::Parsing {
                text: Some(text), ..
            } => {
                if verbose {
                    format!("{self}\n{text}")
                } else {
                    format!("{self} (enable verbose mode to see server response)")
                }
            }
            Error::MulticallFault { index, source } => {
                format!("multicall item {index} failed: {}", source.message(verbose))
            }
            _ => self.to_string(),
        }
    }

    /// Expired credentials are the only auth failure worth a fresh login.
    pub fn is_expired_auth(&self) -> bool {
        match self {
            Error::Auth { expired, .. } => *expired,
            Error::MulticallFault { source, .. } => source.is_expired_auth(),
            _ => false,
        }
    }

    pub fn is_not_found(&self) -> bool {
        match self {
            Error::Request { code, .. } => *code == Some(404),
            Error::NonexistentItem { .. } => true,
            Error::MulticallFault { source, .. } => source.is_not_found(),
            _ => false,
        }
    }

    pub fn status(&self) -> Option<u16> {
        match self {
            Error::Request { code, .. } => *code,
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_hides_server_text_unless_verbose() {
        // Given: サーバー応答本文付きのリクエストエラー
        let err = Error::Request {
            msg: "HTTP Error 500: Internal Server Error".to_string(),
            code: Some(500),
            text: Some("stack trace".to_string()),
        };

        // When / Then: 非verboseでは本文を隠す
        let quiet = err.message(false);
        assert!(quiet.starts_with("HTTP Error 500"));
        assert!(!quiet.contains("stack trace"));
        assert!(quiet.contains("enable verbose mode"));

        // verboseでは本文を表示
        assert!(err.message(true).ends_with("stack trace"));
    }

    #[test]
    fn test_expired_flag_detection() {
        assert!(Error::expired("token expired").is_expired_auth());
        assert!(!Error::auth("authentication failed").is_expired_auth());
        assert!(!Error::request("boom").is_expired_auth());

        let fault = Error::MulticallFault {
            index: 2,
            source: Box::new(Error::expired("token expired")),
        };
        assert!(fault.is_expired_auth());
    }

    #[test]
    fn test_nonexistent_display() {
        let err = Error::NonexistentItem { ids: vec![1, 42] };
        assert_eq!(err.to_string(), "nonexistent item ID(s): 1, 42");
        assert!(err.is_not_found());
    }

    #[test]
    fn test_moved_display() {
        let err = Error::Moved {
            old: "http://a/rest".to_string(),
            new: "https://b/rest".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "service moved permanently: http://a/rest -> https://b/rest"
        );
    }
}
