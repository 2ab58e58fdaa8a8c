pub mod registry;
pub mod tracker;
pub mod trackers;

pub use registry::{ServiceKind, resolve};
pub use tracker::Tracker;

use std::sync::{Arc, RwLock};

use serde_json::Value;
use tracing::info;

use crate::config::{Constants, ServiceConfig};
use crate::encoding::{Encoder, JsonEncoder, XmlEncoder};
use crate::error::{Error, Result};
use crate::http::{HttpRequest, Reply};
use crate::models::{GetOptions, SearchQuery};
use crate::protocol::{JsonRpc, Protocol, ProtocolKind, Rest, XmlRpc};
use crate::request::{Output, Params, Record, Request, require_ids};
use crate::session::Session;

/// One configured tracker connection.
///
/// Cheap to clone; clones share the HTTP session, worker permits and
/// auth token.
#[derive(Clone)]
pub struct Service {
    session: Session,
    config: Arc<ServiceConfig>,
    tracker: Arc<dyn Tracker>,
    encoder: Arc<dyn Encoder>,
    protocol: Arc<dyn Protocol>,
    token: Arc<RwLock<Option<String>>>,
    constants: &'static Constants,
}

impl Service {
    /// Builds a service for the configured kind, walking its fallbacks to
    /// the first implemented tracker.
    pub fn new(config: ServiceConfig) -> Result<Self> {
        let tracker = resolve(&config)?;
        let (encoder, protocol): (Arc<dyn Encoder>, Arc<dyn Protocol>) = match tracker.protocol() {
            ProtocolKind::Rest => (Arc::new(JsonEncoder), Arc::new(Rest)),
            ProtocolKind::JsonRpc => (Arc::new(JsonEncoder), Arc::new(JsonRpc)),
            ProtocolKind::XmlRpc => (Arc::new(XmlEncoder), Arc::new(XmlRpc)),
        };
        Self::with_parts(config, tracker, encoder, protocol)
    }

    pub fn with_parts(
        config: ServiceConfig,
        tracker: Arc<dyn Tracker>,
        encoder: Arc<dyn Encoder>,
        protocol: Arc<dyn Protocol>,
    ) -> Result<Self> {
        let session = Session::new(&config)?;
        let token = config.auth_token.clone();
        Ok(Self {
            session,
            config: Arc::new(config),
            tracker,
            encoder,
            protocol,
            token: Arc::new(RwLock::new(token)),
            constants: Constants::get(),
        })
    }

    pub fn config(&self) -> &ServiceConfig {
        &self.config
    }

    pub fn tracker(&self) -> &dyn Tracker {
        self.tracker.as_ref()
    }

    pub fn encoder(&self) -> &dyn Encoder {
        self.encoder.as_ref()
    }

    pub fn protocol(&self) -> &dyn Protocol {
        self.protocol.as_ref()
    }

    pub fn constants(&self) -> &Constants {
        self.constants
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    /// Page size used when a paged request doesn't set one.
    pub fn max_results(&self) -> usize {
        self.config
            .max_results
            .unwrap_or_else(|| self.tracker.default_max_results())
    }

    /// Absolute URL for an API endpoint; absolute URLs pass through.
    pub fn url(&self, endpoint: &str) -> String {
        if endpoint.starts_with("http://") || endpoint.starts_with("https://") {
            endpoint.to_string()
        } else {
            format!("{}{}", self.tracker.api_root(), endpoint)
        }
    }

    pub fn token(&self) -> Option<String> {
        self.token.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Replaces the auth token. Only done around logins, before requests
    /// are dispatched.
    pub fn set_token(&self, token: Option<String>) {
        *self.token.write().unwrap_or_else(|e| e.into_inner()) = token;
    }

    pub(crate) fn inject_auth(&self, params: &mut Params, headers: &mut Vec<(String, String)>) {
        let token = self.token();
        self.tracker
            .inject_auth(&self.config, token.as_deref(), params, headers);
    }

    /// Runs one finalized request through the session and decodes the
    /// reply, mapping failures onto the error taxonomy.
    pub async fn execute(&self, request: &HttpRequest) -> Result<Reply> {
        let response = self.session.send(request).await?;
        if !response.is_success() {
            return Err(self
                .tracker
                .failure(&response)
                .unwrap_or_else(|| response.error()));
        }

        let data = self.encoder.decode(&response)?;
        let data = self.protocol.unwrap(data, self.tracker.as_ref())?;
        Ok(Reply::with_headers(data, response.headers))
    }

    pub fn get_request(&self, ids: &[u64], options: GetOptions) -> Result<Request> {
        require_ids(ids)?;
        self.tracker.get(self, ids, options)
    }

    /// Fetches items, with comments, attachments and changes as requested.
    pub async fn get(&self, ids: &[u64], options: GetOptions) -> Result<Output> {
        let request = self.get_request(ids, options)?;
        self.send(request).await
    }

    pub async fn search(&self, query: &SearchQuery) -> Result<Output> {
        let request = self.tracker.search(self, query)?;
        self.send(request).await
    }

    pub async fn comments(&self, ids: &[u64]) -> Result<Output> {
        require_ids(ids)?;
        let request = self.tracker.comments(self, ids)?;
        self.send(request).await
    }

    pub async fn attachments(&self, ids: &[u64]) -> Result<Output> {
        require_ids(ids)?;
        let request = self.tracker.attachments(self, ids)?;
        self.send(request).await
    }

    pub async fn changes(&self, ids: &[u64]) -> Result<Output> {
        require_ids(ids)?;
        let request = self.tracker.changes(self, ids)?;
        self.send(request).await
    }

    pub async fn modify(&self, ids: &[u64], changes: &Params) -> Result<Output> {
        require_ids(ids)?;
        if changes.is_empty() {
            return Err(Error::Usage("no changes specified".to_string()));
        }
        let request = self.tracker.modify(self, ids, changes)?;
        self.send(request).await
    }

    pub async fn version(&self) -> Result<Output> {
        let request = self.tracker.version(self)?;
        self.send(request).await
    }

    /// Logs in with the configured user and password and keeps the token.
    pub async fn login(&self) -> Result<String> {
        let (user, password) = match (&self.config.user, &self.config.password) {
            (Some(user), Some(password)) => (user.clone(), password.clone()),
            _ => return Err(Error::Usage("login requires a user and password".to_string())),
        };

        let request = self.tracker.login(self, &user, &password)?;
        self.set_token(None);
        let token = match self.send(request).await? {
            Output::Value(Record::Value(Value::String(token))) => token,
            _ => return Err(Error::parsing("login response contained no token")),
        };

        info!(user = %user, service = self.tracker.name(), "logged in");
        self.set_token(Some(token.clone()));
        Ok(token)
    }
}

impl std::fmt::Debug for Service {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Service")
            .field("base", &self.config.base)
            .field("kind", &self.tracker.kind())
            .finish()
    }
}
