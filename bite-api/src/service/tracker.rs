use serde_json::Value;

use super::{Service, ServiceKind};
use crate::config::{Credentials, ServiceConfig};
use crate::error::{Error, Result};
use crate::http::RawResponse;
use crate::models::{GetOptions, SearchQuery};
use crate::protocol::ProtocolKind;
use crate::request::{Params, Request};

/// Per-tracker knowledge: where the API lives, how auth and errors work,
/// and how each operation is expressed as a request tree.
///
/// Operations a tracker doesn't support keep the default, which fails
/// with [`Error::Unsupported`] before anything is sent.
pub trait Tracker: Send + Sync {
    fn kind(&self) -> ServiceKind;

    fn name(&self) -> &'static str {
        self.kind().family()
    }

    /// Prefix prepended to relative endpoints.
    fn api_root(&self) -> &str;

    /// Server side page size cap; 0 disables paging.
    fn default_max_results(&self) -> usize;

    fn protocol(&self) -> ProtocolKind {
        ProtocolKind::Rest
    }

    /// Adds credentials to an outgoing request. Token auth wins over
    /// user/password.
    fn inject_auth(
        &self,
        config: &ServiceConfig,
        token: Option<&str>,
        _params: &mut Params,
        headers: &mut Vec<(String, String)>,
    ) {
        let credentials = match token {
            Some(token) => Some(Credentials::Token(token.to_string())),
            None => config.credentials(),
        };
        if let Some(credentials) = credentials {
            headers.push(("Authorization".to_string(), credentials.header_value()));
        }
    }

    /// Maps a native error code and message onto the error taxonomy.
    fn service_error(&self, code: Option<i64>, msg: String) -> Error {
        Error::Service {
            service: self.name().to_string(),
            msg,
            code,
        }
    }

    /// Inspects successful REST replies for embedded errors.
    fn check_response(&self, data: Value) -> Result<Value> {
        Ok(data)
    }

    /// Service specific classification of a failed response; `None` falls
    /// back to the generic one.
    fn failure(&self, _response: &RawResponse) -> Option<Error> {
        None
    }

    fn get(&self, _service: &Service, _ids: &[u64], _options: GetOptions) -> Result<Request> {
        Err(self.unsupported("get"))
    }

    fn search(&self, _service: &Service, _query: &SearchQuery) -> Result<Request> {
        Err(self.unsupported("search"))
    }

    fn comments(&self, _service: &Service, _ids: &[u64]) -> Result<Request> {
        Err(self.unsupported("comments"))
    }

    fn attachments(&self, _service: &Service, _ids: &[u64]) -> Result<Request> {
        Err(self.unsupported("attachments"))
    }

    fn changes(&self, _service: &Service, _ids: &[u64]) -> Result<Request> {
        Err(self.unsupported("changes"))
    }

    /// Applies field changes to the given items.
    fn modify(&self, _service: &Service, _ids: &[u64], _changes: &Params) -> Result<Request> {
        Err(self.unsupported("modify"))
    }

    fn version(&self, _service: &Service) -> Result<Request> {
        Err(self.unsupported("version"))
    }

    fn login(&self, _service: &Service, _user: &str, _password: &str) -> Result<Request> {
        Err(self.unsupported("login"))
    }

    fn unsupported(&self, operation: &str) -> Error {
        Error::Unsupported(format!("{} for {}", operation, self.kind()))
    }
}

/// Body of a failed response as JSON, if it is JSON.
pub(crate) fn error_body(response: &RawResponse) -> Option<Value> {
    serde_json::from_str(&response.body).ok()
}

/// Auth failure carrying the service's own message.
pub(crate) fn auth_failure(response: &RawResponse, msg: Option<&str>) -> Error {
    let text = msg.unwrap_or(&response.body);
    Error::Auth {
        msg: match msg {
            Some(msg) => format!("authentication failed: {}", msg),
            None => "authentication failed".to_string(),
        },
        code: Some(i64::from(response.status)),
        expired: text.to_lowercase().contains("expired"),
    }
}
