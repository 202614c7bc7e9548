use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tracing::{debug, warn};

use crate::correlation::{self, CORRELATION_HEADER};
use crate::error::Error;

/// Header echoed on state-changing requests (double-submit pattern).
pub const CSRF_HEADER: &str = "X-CSRF-Token";

const TOKEN_PATH: &str = "/auth/csrf-token";

#[derive(Debug, Deserialize)]
struct CsrfTokenResponse {
    csrf_token: String,
}

type FetchResult = Result<String, String>;

#[derive(Debug)]
struct CsrfState {
    cached: Option<String>,
    /// Present while a fetch is underway; late callers wait on it instead of
    /// issuing their own request.
    inflight: Option<watch::Receiver<Option<FetchResult>>>,
    /// Bumped by clear/refresh so a fetch started before the bump cannot
    /// repopulate the cache with a stale token.
    generation: u64,
}

/// Single-flight cache of the CSRF double-submit token.
///
/// Concurrent callers needing a token while none is cached share one
/// network round trip. A fetch failure propagates to every waiter and
/// leaves the cache empty, so the next call retries from scratch. The
/// token lives in memory only and dies with the process.
#[derive(Debug, Clone)]
pub struct CsrfTokenManager {
    http: reqwest::Client,
    fetch_timeout: Duration,
    state: Arc<Mutex<CsrfState>>,
}

impl CsrfTokenManager {
    pub fn new(http: reqwest::Client, fetch_timeout: Duration) -> Self {
        Self {
            http,
            fetch_timeout,
            state: Arc::new(Mutex::new(CsrfState {
                cached: None,
                inflight: None,
                generation: 0,
            })),
        }
    }

    /// Return the cached token, join an in-flight fetch, or start one.
    pub async fn get_token(&self, base_url: &str) -> Result<String, Error> {
        enum Role {
            Lead(watch::Sender<Option<FetchResult>>, u64),
            Wait(watch::Receiver<Option<FetchResult>>),
        }

        loop {
            let role = {
                let mut state = self.state.lock().await;
                if let Some(token) = &state.cached {
                    return Ok(token.clone());
                }
                // Discard a dead marker left by a fetch that was dropped
                // before publishing its result.
                let stale = state
                    .inflight
                    .as_ref()
                    .is_some_and(|rx| rx.borrow().is_none() && rx.has_changed().is_err());
                if stale {
                    state.inflight = None;
                }
                if let Some(rx) = &state.inflight {
                    Role::Wait(rx.clone())
                } else {
                    let (tx, rx) = watch::channel(None);
                    state.inflight = Some(rx);
                    Role::Lead(tx, state.generation)
                }
            };

            let mut rx = match role {
                Role::Lead(tx, generation) => {
                    return self.lead_fetch(base_url, tx, generation).await;
                }
                Role::Wait(rx) => rx,
            };

            let outcome = loop {
                let current = rx.borrow().clone();
                if let Some(result) = current {
                    break Some(result);
                }
                if rx.changed().await.is_err() {
                    break None;
                }
            };
            match outcome {
                Some(Ok(token)) => return Ok(token),
                Some(Err(message)) => return Err(Error::CsrfAcquisition(message)),
                // The leading fetch was cancelled; start over.
                None => continue,
            }
        }
    }

    /// Discard the cache and fetch unconditionally. Callers arriving while
    /// the refresh is underway join it instead of fetching again.
    pub async fn refresh_token(&self, base_url: &str) -> Result<String, Error> {
        let (tx, generation) = {
            let mut state = self.state.lock().await;
            state.cached = None;
            state.generation = state.generation.wrapping_add(1);
            let (tx, rx) = watch::channel(None);
            state.inflight = Some(rx);
            (tx, state.generation)
        };
        debug!("refreshing csrf token");
        self.lead_fetch(base_url, tx, generation).await
    }

    /// Discard the cache without fetching. An in-flight fetch still delivers
    /// its result to current waiters but will not repopulate the cache.
    pub async fn clear_token(&self) {
        let mut state = self.state.lock().await;
        state.cached = None;
        state.generation = state.generation.wrapping_add(1);
        state.inflight = None;
        debug!("csrf token cleared");
    }

    async fn lead_fetch(
        &self,
        base_url: &str,
        tx: watch::Sender<Option<FetchResult>>,
        generation: u64,
    ) -> Result<String, Error> {
        let result = self.fetch(base_url).await;
        {
            let mut state = self.state.lock().await;
            if state.generation == generation {
                if let Ok(token) = &result {
                    state.cached = Some(token.clone());
                }
                state.inflight = None;
            }
        }
        let _ = tx.send(Some(result.clone()));
        result.map_err(Error::CsrfAcquisition)
    }

    async fn fetch(&self, base_url: &str) -> FetchResult {
        let url = format!("{}{}", base_url.trim_end_matches('/'), TOKEN_PATH);
        debug!(url = %url, "fetching csrf token");

        let response = self
            .http
            .get(&url)
            .timeout(self.fetch_timeout)
            .header(CORRELATION_HEADER, correlation::new_correlation_id().as_str())
            .send()
            .await
            .map_err(|err| format!("token request failed: {err}"))?;

        let status = response.status();
        if !status.is_success() {
            warn!(status = %status, "csrf token endpoint returned an error");
            return Err(format!("token endpoint returned status {status}"));
        }

        let body: CsrfTokenResponse = response
            .json()
            .await
            .map_err(|err| format!("invalid token response: {err}"))?;
        if body.csrf_token.is_empty() {
            return Err("token endpoint returned an empty token".to_string());
        }
        Ok(body.csrf_token)
    }

    #[cfg(test)]
    async fn cached_token(&self) -> Option<String> {
        self.state.lock().await.cached.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockito::Server;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn manager() -> CsrfTokenManager {
        CsrfTokenManager::new(reqwest::Client::new(), Duration::from_secs(5))
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn concurrent_callers_share_one_fetch() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("GET", "/auth/csrf-token")
            .with_header("content-type", "application/json")
            .with_body_from_request(|_| {
                // Hold the response open long enough for every caller to
                // join the in-flight fetch.
                std::thread::sleep(Duration::from_millis(150));
                br#"{"csrf_token":"tok-1"}"#.to_vec()
            })
            .expect(1)
            .create_async()
            .await;

        let mgr = manager();
        let base = server.url();
        let mut handles = Vec::new();
        for _ in 0..4 {
            let mgr = mgr.clone();
            let base = base.clone();
            handles.push(tokio::spawn(async move { mgr.get_token(&base).await }));
        }
        for handle in handles {
            assert_eq!(handle.await.unwrap().unwrap(), "tok-1");
        }
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn failure_leaves_cache_empty_and_next_call_retries() {
        let mut server = Server::new_async().await;
        let failing = server
            .mock("GET", "/auth/csrf-token")
            .with_status(500)
            .expect(1)
            .create_async()
            .await;

        let mgr = manager();
        let base = server.url();
        let err = mgr.get_token(&base).await.unwrap_err();
        assert!(matches!(err, Error::CsrfAcquisition(_)));
        assert!(mgr.cached_token().await.is_none());
        failing.assert_async().await;

        server.reset_async().await;
        let healthy = server
            .mock("GET", "/auth/csrf-token")
            .with_header("content-type", "application/json")
            .with_body(r#"{"csrf_token":"tok-2"}"#)
            .expect(1)
            .create_async()
            .await;
        assert_eq!(mgr.get_token(&base).await.unwrap(), "tok-2");
        healthy.assert_async().await;
    }

    #[tokio::test]
    async fn cached_token_is_reused_without_refetch() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("GET", "/auth/csrf-token")
            .with_header("content-type", "application/json")
            .with_body(r#"{"csrf_token":"tok-1"}"#)
            .expect(1)
            .create_async()
            .await;

        let mgr = manager();
        let base = server.url();
        assert_eq!(mgr.get_token(&base).await.unwrap(), "tok-1");
        assert_eq!(mgr.get_token(&base).await.unwrap(), "tok-1");
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn refresh_fetches_even_when_a_token_is_cached() {
        let mut server = Server::new_async().await;
        let calls = AtomicUsize::new(0);
        let mock = server
            .mock("GET", "/auth/csrf-token")
            .with_header("content-type", "application/json")
            .with_body_from_request(move |_| {
                if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                    br#"{"csrf_token":"tok-1"}"#.to_vec()
                } else {
                    br#"{"csrf_token":"tok-2"}"#.to_vec()
                }
            })
            .expect(2)
            .create_async()
            .await;

        let mgr = manager();
        let base = server.url();
        assert_eq!(mgr.get_token(&base).await.unwrap(), "tok-1");
        assert_eq!(mgr.refresh_token(&base).await.unwrap(), "tok-2");
        assert_eq!(mgr.cached_token().await.unwrap(), "tok-2");
        mock.assert_async().await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn clear_during_inflight_fetch_prevents_stale_caching() {
        let mut server = Server::new_async().await;
        let calls = AtomicUsize::new(0);
        let mock = server
            .mock("GET", "/auth/csrf-token")
            .with_header("content-type", "application/json")
            .with_body_from_request(move |_| {
                if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                    std::thread::sleep(Duration::from_millis(200));
                    br#"{"csrf_token":"stale"}"#.to_vec()
                } else {
                    br#"{"csrf_token":"fresh"}"#.to_vec()
                }
            })
            .expect(2)
            .create_async()
            .await;

        let mgr = manager();
        let base = server.url();
        let pending = {
            let mgr = mgr.clone();
            let base = base.clone();
            tokio::spawn(async move { mgr.get_token(&base).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        mgr.clear_token().await;

        // The in-flight caller still gets its token, but the cleared cache
        // must not be repopulated with it.
        assert_eq!(pending.await.unwrap().unwrap(), "stale");
        assert!(mgr.cached_token().await.is_none());

        assert_eq!(mgr.get_token(&base).await.unwrap(), "fresh");
        mock.assert_async().await;
    }
}
