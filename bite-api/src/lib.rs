pub mod cache;
pub mod config;
mod dispatch;
pub mod encoding;
pub mod error;
pub mod http;
pub mod logging;
pub mod models;
pub mod protocol;
pub mod request;
pub mod retry;
pub mod service;
pub mod session;

pub use config::{Credentials, ServiceConfig};
pub use error::{Error, Result};
pub use models::*;

// Request re-exports
pub use request::{
    CompositeRequest, LeafRequest, MergedMulticall, Multicall, MulticallPart, NullRequest, Output,
    PagedRequest, Paging, Record, Request, ResultStream, RpcCall,
};

// Service re-exports
pub use service::{Service, ServiceKind, Tracker};

// Cache re-exports
pub use cache::{AuthStore, FileCache, SettingsCache};

pub use retry::login_retry;
