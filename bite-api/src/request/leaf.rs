use std::sync::Arc;

use serde_json::Value;

use super::{ErrorHook, Params, Parser, Record, RequestNode};
use crate::Service;
use crate::error::{Error, Result};
use crate::http::{HttpRequest, Method, Reply};

/// How params travel on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Encoding {
    Query,
    Body,
    Rpc,
}

/// A request wrapping exactly one physical call.
#[derive(Clone)]
pub struct LeafRequest {
    options: Vec<String>,
    params: Params,
    method: Method,
    endpoint: String,
    call: Option<String>,
    args: Option<Vec<Value>>,
    encoding: Encoding,
    verbatim: bool,
    prepared: Option<HttpRequest>,
    parser: Parser,
    on_error: Option<ErrorHook>,
    many: bool,
}

impl LeafRequest {
    fn new(method: Method, endpoint: impl Into<String>, encoding: Encoding) -> Self {
        Self {
            options: Vec::new(),
            params: Params::new(),
            method,
            endpoint: endpoint.into(),
            call: None,
            args: None,
            encoding,
            verbatim: false,
            prepared: None,
            parser: Arc::new(|reply: Reply| Ok(vec![Record::Value(reply.data)])),
            on_error: None,
            many: false,
        }
    }

    /// GET with params in the query string.
    pub fn get(endpoint: impl Into<String>) -> Self {
        Self::new(Method::Get, endpoint, Encoding::Query)
    }

    /// POST with params encoded as the body.
    pub fn post(endpoint: impl Into<String>) -> Self {
        Self::new(Method::Post, endpoint, Encoding::Body)
    }

    pub fn put(endpoint: impl Into<String>) -> Self {
        Self::new(Method::Put, endpoint, Encoding::Body)
    }

    /// Remote procedure call posted to the service's RPC endpoint.
    pub fn rpc(call: impl Into<String>) -> Self {
        let mut request = Self::new(Method::Post, "", Encoding::Rpc);
        request.call = Some(call.into());
        request
    }

    pub fn param(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.params.insert(key.into(), value.into());
        self
    }

    /// Positional RPC arguments. Without them the params map is sent as
    /// the single argument.
    pub fn args(mut self, args: Vec<Value>) -> Self {
        self.args = Some(args);
        self
    }

    pub fn option(mut self, option: impl Into<String>) -> Self {
        self.options.push(option.into());
        self
    }

    pub fn parser<F>(mut self, parser: F) -> Self
    where
        F: Fn(Reply) -> Result<Vec<Record>> + Send + Sync + 'static,
    {
        self.parser = Arc::new(parser);
        self
    }

    pub fn on_error(mut self, hook: ErrorHook) -> Self {
        self.on_error = Some(hook);
        self
    }

    /// Yield every parsed record instead of the first one.
    pub fn many(mut self) -> Self {
        self.many = true;
        self
    }

    pub fn yields_many(&self) -> bool {
        self.many
    }

    pub fn params(&self) -> &Params {
        &self.params
    }

    /// Mutable params. Changes after finalizing need a [`reset`](Self::reset).
    pub fn params_mut(&mut self) -> &mut Params {
        &mut self.params
    }

    pub fn push_option(&mut self, option: impl Into<String>) {
        self.options.push(option.into());
    }

    pub fn call(&self) -> Option<&str> {
        self.call.as_deref()
    }

    pub(crate) fn set_args(&mut self, args: Vec<Value>) {
        self.args = Some(args);
    }

    /// Switch to a server-supplied URL used as is.
    pub fn follow(&mut self, url: impl Into<String>) {
        self.endpoint = url.into();
        self.verbatim = true;
        self.prepared = None;
    }

    pub fn reset(&mut self) {
        self.prepared = None;
    }

    pub fn is_finalized(&self) -> bool {
        self.prepared.is_some()
    }

    pub fn prepared(&self) -> Result<&HttpRequest> {
        self.prepared
            .as_ref()
            .ok_or_else(|| Error::Unexpected("request sent before being finalized".to_string()))
    }
}

impl RequestNode for LeafRequest {
    type Input = Reply;
    type Output = Vec<Record>;

    fn options(&self) -> Vec<String> {
        self.options.clone()
    }

    fn finalize(&mut self, service: &Service) -> Result<()> {
        if self.prepared.is_some() {
            return Ok(());
        }

        // auth goes into a copy so the request's own params stay clean
        let mut params = self.params.clone();
        let mut headers = Vec::new();
        service.inject_auth(&mut params, &mut headers);

        let base = if self.verbatim {
            self.endpoint.clone()
        } else {
            service.url(&self.endpoint)
        };

        let (url, body) = match self.encoding {
            Encoding::Query if self.verbatim => (base, None),
            Encoding::Query => (with_query(&base, &params), None),
            Encoding::Body => {
                headers.push((
                    "Content-Type".to_string(),
                    service.encoder().content_type().to_string(),
                ));
                let body = if params.is_empty() {
                    None
                } else {
                    Some(service.encoder().encode(&Value::Object(params))?)
                };
                (base, body)
            }
            Encoding::Rpc => {
                let call = self
                    .call
                    .as_deref()
                    .ok_or_else(|| Error::Unexpected("RPC request without a method".to_string()))?;
                let args = match &self.args {
                    Some(args) => args.clone(),
                    None => vec![Value::Object(params)],
                };
                let envelope = service.protocol().envelope(call, args)?;
                let content_type = service.encoder().content_type();
                headers.push(("Content-Type".to_string(), content_type.to_string()));
                headers.push(("Accept".to_string(), content_type.to_string()));
                (base, Some(service.encoder().encode(&envelope)?))
            }
        };

        self.prepared = Some(HttpRequest {
            method: self.method,
            url,
            headers,
            body,
        });
        Ok(())
    }

    fn prepare(&mut self, service: &Service) -> Result<Vec<HttpRequest>> {
        self.finalize(service)?;
        Ok(vec![self.prepared()?.clone()])
    }

    fn parse(&self, reply: Reply) -> Result<Vec<Record>> {
        (self.parser)(reply)
    }

    fn handle_exception(&self, err: Error) -> Error {
        match &self.on_error {
            Some(hook) => hook(err),
            None => err,
        }
    }
}

/// Appends params as a query string. Lists repeat their key.
pub fn with_query(url: &str, params: &Params) -> String {
    let mut pairs = Vec::new();
    for (key, value) in params {
        let values = match value {
            Value::Array(items) => items.iter().collect(),
            other => vec![other],
        };
        for value in values {
            let value = match value {
                Value::Null => continue,
                Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            pairs.push(format!(
                "{}={}",
                urlencoding::encode(key),
                urlencoding::encode(&value)
            ));
        }
    }

    if pairs.is_empty() {
        return url.to_string();
    }
    let sep = if url.contains('?') { '&' } else { '?' };
    format!("{}{}{}", url, sep, pairs.join("&"))
}
