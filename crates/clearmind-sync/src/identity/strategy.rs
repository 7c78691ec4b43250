//! Ordered fallback between remote and local authentication

use std::fmt;
use std::future::Future;

use tracing::debug;

use crate::error::{SyncError, SyncResult};
use crate::network::NetworkStatus;

/// Where an authentication attempt is made.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthRoute {
    Remote,
    Local,
}

impl fmt::Display for AuthRoute {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AuthRoute::Remote => f.write_str("remote"),
            AuthRoute::Local => f.write_str("local"),
        }
    }
}

/// Result of one route.
#[derive(Debug)]
pub enum AttemptOutcome<T> {
    Success(T),
    /// The next route may be tried
    TransientFailure(SyncError),
    /// Stop and surface this error
    PermanentFailure(SyncError),
}

impl<T> AttemptOutcome<T> {
    /// Outcome of a route that already reached its backend: any failure is final.
    pub fn settled(result: SyncResult<T>) -> Self {
        match result {
            Ok(value) => AttemptOutcome::Success(value),
            Err(e) => AttemptOutcome::PermanentFailure(e),
        }
    }
}

/// Routes to try, in order, for the given connectivity.
pub fn plan(status: NetworkStatus) -> Vec<AuthRoute> {
    match status {
        NetworkStatus::Online => vec![AuthRoute::Remote, AuthRoute::Local],
        NetworkStatus::Offline => vec![AuthRoute::Local],
    }
}

/// Run `attempt` for each route until one succeeds or fails permanently.
///
/// If every route fails transiently, the last error is returned.
pub async fn select<T, F, Fut>(routes: &[AuthRoute], mut attempt: F) -> SyncResult<T>
where
    F: FnMut(AuthRoute) -> Fut,
    Fut: Future<Output = AttemptOutcome<T>>,
{
    let mut last_error = None;
    for &route in routes {
        match attempt(route).await {
            AttemptOutcome::Success(value) => {
                debug!(%route, "Authentication route succeeded");
                return Ok(value);
            }
            AttemptOutcome::PermanentFailure(e) => {
                debug!(%route, error = %e, "Authentication route failed permanently");
                return Err(e);
            }
            AttemptOutcome::TransientFailure(e) => {
                debug!(%route, error = %e, "Authentication route unavailable, falling back");
                last_error = Some(e);
            }
        }
    }
    Err(last_error.unwrap_or_else(|| SyncError::Connectivity("no authentication route".into())))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plan_follows_connectivity() {
        assert_eq!(
            plan(NetworkStatus::Online),
            vec![AuthRoute::Remote, AuthRoute::Local]
        );
        assert_eq!(plan(NetworkStatus::Offline), vec![AuthRoute::Local]);
    }

    #[tokio::test]
    async fn test_transient_failure_falls_through() {
        let mut tried = Vec::new();
        let result = select(&plan(NetworkStatus::Online), |route| {
            tried.push(route);
            async move {
                match route {
                    AuthRoute::Remote => {
                        AttemptOutcome::TransientFailure(SyncError::Connectivity("timeout".into()))
                    }
                    AuthRoute::Local => AttemptOutcome::Success("local"),
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), "local");
        assert_eq!(tried, vec![AuthRoute::Remote, AuthRoute::Local]);
    }

    #[tokio::test]
    async fn test_permanent_failure_stops_chain() {
        let mut tried = Vec::new();
        let result: SyncResult<()> = select(&plan(NetworkStatus::Online), |route| {
            tried.push(route);
            async { AttemptOutcome::PermanentFailure(SyncError::InvalidCredentials) }
        })
        .await;

        assert!(matches!(result, Err(SyncError::InvalidCredentials)));
        assert_eq!(tried, vec![AuthRoute::Remote]);
    }

    #[tokio::test]
    async fn test_all_transient_returns_last_error() {
        let result: SyncResult<()> = select(&[AuthRoute::Remote], |_| async {
            AttemptOutcome::TransientFailure(SyncError::Connectivity("offline".into()))
        })
        .await;
        assert!(matches!(result, Err(SyncError::Connectivity(_))));
    }

    #[test]
    fn test_settled_failures_are_permanent() {
        assert!(matches!(
            AttemptOutcome::<()>::settled(Err(SyncError::UserNotFound("x".into()))),
            AttemptOutcome::PermanentFailure(_)
        ));
        assert!(matches!(
            AttemptOutcome::settled(Ok(1)),
            AttemptOutcome::Success(1)
        ));
    }
}
