use std::future::Future;

use tracing::warn;

use crate::Service;
use crate::cache::AuthStore;
use crate::error::{Error, Result};

/// Runs one top-level operation, logging in again and rerunning it once if
/// it fails on an expired token.
///
/// Only expired auth errors are retried, and only when the service has a user
/// and password to log in with. The operation is rerun from scratch, never
/// resumed, so paging state is rebuilt. A fresh token is written to `store`;
/// on trackers without a login call the original auth error is returned.
pub async fn login_retry<T, F, Fut>(service: &Service, store: Option<&AuthStore>, mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let err = match op().await {
        Err(err) if err.is_expired_auth() && service.config().credentials().is_some() => err,
        other => return other,
    };

    warn!(error = %err, "auth token expired, logging in again");
    let token = match service.login().await {
        Ok(token) => token,
        // nothing to log in with; the expired token is the real problem
        Err(Error::Unsupported(_)) => return Err(err),
        Err(login_err) => {
            if let Some(store) = store {
                store.remove().await?;
            }
            return Err(login_err);
        }
    };
    if let Some(store) = store {
        store.save(&token).await?;
    }
    op().await
}
