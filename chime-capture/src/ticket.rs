use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;

use crate::auth::AuthProvider;
use crate::cloud::{CloudClient, CloudError, TicketResponse};

/// A ticket older than this is considered stale and refreshed proactively.
pub const TICKET_MAX_AGE: Duration = Duration::from_secs(30 * 60);

const MAX_RETRIES: u32 = 3;
const RETRY_SPACING: Duration = Duration::from_secs(1);

#[derive(Debug, thiserror::Error)]
pub enum TicketError {
    #[error("could not obtain a signalling ticket after {attempts} attempts")]
    Unavailable { attempts: u32 },
}

/// Seam over the ticket endpoint so the cache can be exercised without a
/// network.
#[async_trait]
pub trait TicketIssuer: Send + Sync {
    async fn request_ticket(&self, bearer: &str) -> Result<TicketResponse, CloudError>;
}

#[async_trait]
impl TicketIssuer for CloudClient {
    async fn request_ticket(&self, bearer: &str) -> Result<TicketResponse, CloudError> {
        self.request_signalsocket_ticket(bearer).await
    }
}

/// Cache for the short-lived WebSocket signalling ticket.
///
/// Owned exclusively by one live-view client; destroyed with it.
pub struct TicketCache {
    issuer: Arc<dyn TicketIssuer>,
    auth: Arc<dyn AuthProvider>,
    ticket: Option<String>,
    region: Option<String>,
    updated_at: Option<Instant>,
    max_age: Duration,
}

fn is_stale(age: Duration, max_age: Duration) -> bool {
    age >= max_age
}

impl TicketCache {
    pub fn new(issuer: Arc<dyn TicketIssuer>, auth: Arc<dyn AuthProvider>) -> Self {
        Self::with_max_age(issuer, auth, TICKET_MAX_AGE)
    }

    pub fn with_max_age(issuer: Arc<dyn TicketIssuer>, auth: Arc<dyn AuthProvider>, max_age: Duration) -> Self {
        Self {
            issuer,
            auth,
            ticket: None,
            region: None,
            updated_at: None,
            max_age,
        }
    }

    /// Marks the cached ticket stale so the next `get` reissues it, no matter
    /// its age. Used on connection resets and HTTP 404s from the signalling
    /// channel.
    pub fn force_refresh(&mut self) {
        self.updated_at = None;
    }

    pub fn is_fresh(&self) -> bool {
        match (&self.ticket, self.updated_at) {
            (Some(_), Some(updated_at)) => !is_stale(updated_at.elapsed(), self.max_age),
            _ => false,
        }
    }

    /// Returns a `(ticket, region)` pair younger than the max age.
    ///
    /// On failure after the retry budget, the previous ticket is returned as
    /// a last resort — without touching the freshness timestamp, so the next
    /// call tries again.
    pub async fn get(&mut self) -> Result<(String, Option<String>), TicketError> {
        if self.is_fresh() {
            let ticket = self.ticket.clone().expect("checked by is_fresh");
            debug!("Using cached signalling ticket");
            return Ok((ticket, self.region.clone()));
        }

        info!("Refreshing signalling ticket");

        for attempt in 1..=MAX_RETRIES {
            if attempt > 1 {
                tokio::time::sleep(RETRY_SPACING).await;

                // Trade the bearer for a fresh one before retrying; the
                // previous failure may well have been an expired token.
                if !self.auth.refresh_token().await {
                    debug!("Bearer refresh failed before ticket retry, using current token");
                }
            }

            let Some(bearer) = self.auth.get_token().await else {
                warn!(attempt, "No bearer token available for the ticket request");
                continue;
            };

            match self.issuer.request_ticket(&bearer).await {
                Ok(TicketResponse {
                    ticket: Some(ticket),
                    region,
                }) => {
                    self.ticket = Some(ticket.clone());
                    self.region = region.clone();
                    self.updated_at = Some(Instant::now());

                    info!("Signalling ticket refreshed");

                    return Ok((ticket, region));
                }
                Ok(TicketResponse { ticket: None, .. }) => {
                    // No raw-bearer fallback: a response without a ticket is
                    // a failed attempt, full stop.
                    warn!(attempt, "Ticket response carries no ticket field");
                }
                Err(error) if error.is_auth() => {
                    warn!(attempt, %error, "Authentication rejected during ticket request");
                    self.auth.refresh_token().await;
                }
                Err(error) => {
                    warn!(attempt, %error, "Ticket request failed");
                }
            }
        }

        if let Some(ticket) = self.ticket.clone() {
            warn!("Using existing ticket as a last resort after failed refresh attempts");
            return Ok((ticket, self.region.clone()));
        }

        Err(TicketError::Unavailable {
            attempts: MAX_RETRIES,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct FakeAuth {
        refreshes: AtomicU32,
    }

    impl FakeAuth {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                refreshes: AtomicU32::new(0),
            })
        }
    }

    #[async_trait]
    impl AuthProvider for FakeAuth {
        async fn authenticate(&self) -> anyhow::Result<()> {
            Ok(())
        }

        async fn get_token(&self) -> Option<String> {
            Some("bearer".to_owned())
        }

        async fn refresh_token(&self) -> bool {
            self.refreshes.fetch_add(1, Ordering::SeqCst);
            true
        }

        async fn get_account_id(&self) -> anyhow::Result<String> {
            Ok("acct".to_owned())
        }
    }

    struct ScriptedIssuer {
        responses: parking_lot::Mutex<Vec<Result<TicketResponse, CloudError>>>,
        requests: AtomicU32,
    }

    impl ScriptedIssuer {
        fn new(responses: Vec<Result<TicketResponse, CloudError>>) -> Arc<Self> {
            Arc::new(Self {
                responses: parking_lot::Mutex::new(responses),
                requests: AtomicU32::new(0),
            })
        }
    }

    #[async_trait]
    impl TicketIssuer for ScriptedIssuer {
        async fn request_ticket(&self, _bearer: &str) -> Result<TicketResponse, CloudError> {
            self.requests.fetch_add(1, Ordering::SeqCst);
            self.responses
                .lock()
                .pop()
                .unwrap_or(Err(CloudError::Status { status: 500 }))
        }
    }

    fn ok(ticket: &str) -> Result<TicketResponse, CloudError> {
        Ok(TicketResponse {
            ticket: Some(ticket.to_owned()),
            region: Some("eu".to_owned()),
        })
    }

    #[test]
    fn age_equal_to_the_max_is_stale() {
        assert!(is_stale(TICKET_MAX_AGE, TICKET_MAX_AGE));
        assert!(!is_stale(TICKET_MAX_AGE - Duration::from_secs(1), TICKET_MAX_AGE));
    }

    #[tokio::test]
    async fn fresh_tickets_are_served_from_the_cache() {
        let issuer = ScriptedIssuer::new(vec![ok("t-1")]);
        let auth = FakeAuth::new();
        let mut cache = TicketCache::new(Arc::clone(&issuer) as Arc<dyn TicketIssuer>, auth);

        let (first, region) = cache.get().await.expect("first get");
        let (second, _) = cache.get().await.expect("second get");

        assert_eq!(first, "t-1");
        assert_eq!(second, "t-1");
        assert_eq!(region.as_deref(), Some("eu"));
        assert_eq!(issuer.requests.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn force_refresh_reissues_even_a_young_ticket() {
        let issuer = ScriptedIssuer::new(vec![ok("t-2"), ok("t-1")]);
        let auth = FakeAuth::new();
        let mut cache = TicketCache::new(Arc::clone(&issuer) as Arc<dyn TicketIssuer>, auth);

        let (first, _) = cache.get().await.expect("first get");
        cache.force_refresh();
        let (second, _) = cache.get().await.expect("second get");

        assert_eq!(first, "t-1");
        assert_eq!(second, "t-2");
        assert_eq!(issuer.requests.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn auth_errors_trigger_a_bearer_refresh_and_retry() {
        let issuer = ScriptedIssuer::new(vec![ok("t-1"), Err(CloudError::Auth { status: 401 })]);
        let auth = FakeAuth::new();
        let mut cache = TicketCache::new(Arc::clone(&issuer) as Arc<dyn TicketIssuer>, Arc::clone(&auth) as Arc<dyn AuthProvider>);

        let (ticket, _) = cache.get().await.expect("get");

        assert_eq!(ticket, "t-1");
        // One refresh reacting to the 401, one more before the retry.
        assert!(auth.refreshes.load(Ordering::SeqCst) >= 1);
        assert_eq!(issuer.requests.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn stale_fallback_does_not_update_the_timestamp() {
        let issuer = ScriptedIssuer::new(vec![
            Err(CloudError::Status { status: 500 }),
            Err(CloudError::Status { status: 500 }),
            Err(CloudError::Status { status: 500 }),
            ok("t-1"),
        ]);
        let auth = FakeAuth::new();
        let mut cache = TicketCache::with_max_age(Arc::clone(&issuer) as Arc<dyn TicketIssuer>, auth, Duration::ZERO);

        let (first, _) = cache.get().await.expect("first get");
        assert_eq!(first, "t-1");

        // Every subsequent request fails: the previous ticket is handed out,
        // but the cache stays stale so the next get tries again.
        let (fallback, _) = cache.get().await.expect("fallback get");
        assert_eq!(fallback, "t-1");
        assert!(!cache.is_fresh());
        assert_eq!(issuer.requests.load(Ordering::SeqCst), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn missing_ticket_field_is_a_hard_failure() {
        let issuer = ScriptedIssuer::new(vec![
            Ok(TicketResponse {
                ticket: None,
                region: None,
            }),
            Ok(TicketResponse {
                ticket: None,
                region: None,
            }),
            Ok(TicketResponse {
                ticket: None,
                region: None,
            }),
        ]);
        let auth = FakeAuth::new();
        let mut cache = TicketCache::new(issuer, auth);

        let error = cache.get().await.expect_err("must fail");
        assert!(matches!(error, TicketError::Unavailable { attempts: 3 }));
    }
}
