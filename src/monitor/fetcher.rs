// SPDX-License-Identifier: MPL-2.0

//! WAN address discovery with retry, backoff and endpoint failover
//!
//! The lookup is best effort. When every endpoint fails the caller keeps the
//! address it already had; nothing here is fatal.
//!
//! ```text
//! Idle ─► Attempting(endpoint i, retry k) ─┬─► Success
//!                                          ├─► Attempting(i, k+1)   after base·2^k backoff
//!                                          ├─► Attempting(i+1, 0)   retries exhausted
//!                                          └─► Exhausted            no endpoints left
//! ```

use crate::error::FetchError;
use std::future::Future;
use std::net::{IpAddr, UdpSocket};
use std::time::Duration;

/// How often the network sampler refreshes the WAN address.
pub const FETCH_PERIOD: Duration = Duration::from_secs(60);
/// Per-request timeout, much shorter than the whole retry envelope.
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(5);
/// Retries per endpoint after the initial attempt.
pub const MAX_RETRIES: u32 = 3;
/// First backoff delay; doubles on every further retry.
pub const BASE_BACKOFF: Duration = Duration::from_secs(1);

// ============================================================================
// Reachability
// ============================================================================

/// Whether any network path is currently usable.
pub trait Reachability: Send + Sync {
    fn is_reachable(&self) -> bool;
}

/// Asks the kernel for a route to a public address.
///
/// Connecting a UDP socket only performs a route lookup; no packet is sent.
#[derive(Debug, Clone, Copy, Default)]
pub struct RouteCheck;

impl Reachability for RouteCheck {
    fn is_reachable(&self) -> bool {
        let v4 = UdpSocket::bind("0.0.0.0:0").and_then(|s| s.connect("1.1.1.1:80"));
        if v4.is_ok() {
            return true;
        }
        UdpSocket::bind("[::]:0")
            .and_then(|s| s.connect("[2606:4700:4700::1111]:80"))
            .is_ok()
    }
}

impl Reachability for bool {
    fn is_reachable(&self) -> bool {
        *self
    }
}

// ============================================================================
// Lookup Transport
// ============================================================================

/// One request against one endpoint, returning the raw response body.
pub trait AddressLookup: Send + Sync {
    fn lookup(&self, endpoint: &str) -> impl Future<Output = Result<String, FetchError>> + Send;
}

/// Plain unauthenticated HTTP GET.
#[derive(Debug, Clone)]
pub struct HttpLookup {
    client: reqwest::Client,
}

impl HttpLookup {
    pub fn new(timeout: Duration) -> Self {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .connect_timeout(timeout)
            .build()
            .unwrap_or_else(|e| {
                log::warn!("http client setup failed, using defaults: {}", e);
                reqwest::Client::new()
            });
        Self { client }
    }
}

impl Default for HttpLookup {
    fn default() -> Self {
        Self::new(REQUEST_TIMEOUT)
    }
}

impl AddressLookup for HttpLookup {
    fn lookup(&self, endpoint: &str) -> impl Future<Output = Result<String, FetchError>> + Send {
        let request = self.client.get(endpoint);
        let endpoint = endpoint.to_owned();
        async move {
            let transport = |e: reqwest::Error| FetchError::Transport {
                endpoint: endpoint.clone(),
                reason: e.to_string(),
            };
            let response = request.send().await.map_err(transport)?;
            let response = response.error_for_status().map_err(transport)?;
            response.text().await.map_err(transport)
        }
    }
}

/// Whether `text` looks like an IPv4 dotted quad or an IPv6 address.
pub fn is_plausible_address(text: &str) -> bool {
    text.parse::<IpAddr>().is_ok()
}

// ============================================================================
// Fetcher
// ============================================================================

/// Progress of the current fetch cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FetchState {
    pub endpoint_index: usize,
    pub retry_count: u32,
    pub reachable: bool,
}

/// Runs fetch cycles over an ordered list of interchangeable endpoints.
#[derive(Debug)]
pub struct ResilientFetcher<L> {
    lookup: L,
    max_retries: u32,
    base_backoff: Duration,
    state: FetchState,
}

impl<L: AddressLookup> ResilientFetcher<L> {
    pub fn new(lookup: L) -> Self {
        Self::with_policy(lookup, MAX_RETRIES, BASE_BACKOFF)
    }

    pub fn with_policy(lookup: L, max_retries: u32, base_backoff: Duration) -> Self {
        Self {
            lookup,
            max_retries,
            base_backoff,
            state: FetchState::default(),
        }
    }

    pub fn state(&self) -> FetchState {
        self.state
    }

    /// Delay before retry number `retry` (1-based): `base * 2^(retry-1)`.
    pub fn backoff(&self, retry: u32) -> Duration {
        let exponent = retry.saturating_sub(1).min(16);
        self.base_backoff.saturating_mul(1 << exponent)
    }

    /// One full fetch cycle. Makes no request at all when unreachable.
    pub async fn fetch(&mut self, endpoints: &[String], reachability: &dyn Reachability) -> Result<String, FetchError> {
        self.state = FetchState {
            endpoint_index: 0,
            retry_count: 0,
            reachable: reachability.is_reachable(),
        };
        if !self.state.reachable {
            log::debug!("skipping WAN lookup, no network path");
            return Err(FetchError::Unreachable);
        }

        for (index, endpoint) in endpoints.iter().enumerate() {
            self.state.endpoint_index = index;
            self.state.retry_count = 0;
            loop {
                match self.attempt(endpoint).await {
                    Ok(address) => return Ok(address),
                    Err(e) => log::debug!("WAN lookup attempt failed: {}", e),
                }
                self.state.retry_count += 1;
                if self.state.retry_count > self.max_retries {
                    break;
                }
                tokio::time::sleep(self.backoff(self.state.retry_count)).await;
            }
        }

        log::warn!("WAN lookup failed on all {} endpoints", endpoints.len());
        Err(FetchError::Exhausted)
    }

    async fn attempt(&self, endpoint: &str) -> Result<String, FetchError> {
        let body = self.lookup.lookup(endpoint).await?;
        let address = body.trim();
        if is_plausible_address(address) {
            Ok(address.to_owned())
        } else {
            Err(FetchError::InvalidResponse {
                endpoint: endpoint.to_owned(),
                body: address.chars().take(64).collect(),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    /// Replays canned responses and records every endpoint it was asked for.
    #[derive(Default)]
    struct ScriptedLookup {
        responses: Mutex<VecDeque<Result<String, FetchError>>>,
        calls: Mutex<Vec<String>>,
    }

    impl ScriptedLookup {
        fn new(responses: Vec<Result<String, FetchError>>) -> Self {
            Self {
                responses: Mutex::new(responses.into()),
                calls: Mutex::new(Vec::new()),
            }
        }

        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }
    }

    impl AddressLookup for ScriptedLookup {
        fn lookup(&self, endpoint: &str) -> impl Future<Output = Result<String, FetchError>> + Send {
            self.calls.lock().unwrap().push(endpoint.to_owned());
            let next = self.responses.lock().unwrap().pop_front().unwrap_or(Err(FetchError::Transport {
                endpoint: endpoint.to_owned(),
                reason: String::from("script exhausted"),
            }));
            async move { next }
        }
    }

    fn failure() -> Result<String, FetchError> {
        Err(FetchError::Transport {
            endpoint: String::from("test"),
            reason: String::from("connection refused"),
        })
    }

    fn endpoints() -> Vec<String> {
        vec![String::from("http://one"), String::from("http://two")]
    }

    #[test]
    fn validates_address_shapes() {
        assert!(is_plausible_address("203.0.113.7"));
        assert!(is_plausible_address("2001:db8::1"));
        assert!(!is_plausible_address("256.1.1.1"));
        assert!(!is_plausible_address("1.2.3"));
        assert!(!is_plausible_address("<html>rate limited</html>"));
    }

    #[test]
    fn backoff_doubles() {
        let fetcher = ResilientFetcher::new(ScriptedLookup::default());
        assert_eq!(fetcher.backoff(1), Duration::from_secs(1));
        assert_eq!(fetcher.backoff(2), Duration::from_secs(2));
        assert_eq!(fetcher.backoff(3), Duration::from_secs(4));
    }

    #[tokio::test(start_paused = true)]
    async fn first_success_is_returned_trimmed() {
        let mut fetcher = ResilientFetcher::new(ScriptedLookup::new(vec![Ok(String::from("198.51.100.2\n"))]));
        let address = fetcher.fetch(&endpoints(), &true).await;
        assert_eq!(address.as_deref(), Ok("198.51.100.2"));
        assert_eq!(fetcher.lookup.calls(), vec!["http://one"]);
    }

    #[tokio::test(start_paused = true)]
    async fn unreachable_makes_no_calls() {
        let mut fetcher = ResilientFetcher::new(ScriptedLookup::default());
        let result = fetcher.fetch(&endpoints(), &false).await;
        assert_eq!(result, Err(FetchError::Unreachable));
        assert!(fetcher.lookup.calls().is_empty());
        assert!(!fetcher.state().reachable);
    }

    #[tokio::test(start_paused = true)]
    async fn fails_over_after_backoff_envelope() {
        let lookup = ScriptedLookup::new(vec![
            failure(),
            failure(),
            Ok(String::from("not an address")),
            failure(),
            Ok(String::from("192.0.2.10")),
        ]);
        let mut fetcher = ResilientFetcher::new(lookup);
        let started = tokio::time::Instant::now();

        let address = fetcher.fetch(&endpoints(), &true).await;

        assert_eq!(address.as_deref(), Ok("192.0.2.10"));
        assert!(started.elapsed() >= Duration::from_secs(1 + 2 + 4));
        let calls = fetcher.lookup.calls();
        assert_eq!(calls.len(), 5);
        assert!(calls[..4].iter().all(|c| c == "http://one"));
        assert_eq!(calls[4], "http://two");
        assert_eq!(fetcher.state().endpoint_index, 1);
        assert_eq!(fetcher.state().retry_count, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn exhausts_every_endpoint() {
        let mut fetcher = ResilientFetcher::new(ScriptedLookup::default());
        let result = fetcher.fetch(&endpoints(), &true).await;
        assert_eq!(result, Err(FetchError::Exhausted));
        assert_eq!(fetcher.lookup.calls().len(), 8);
    }
}
