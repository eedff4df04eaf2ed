//! Coalescing DNS resolver agent.
//!
//! The resolver is a single task that multiplexes its request mailbox,
//! completions of in-flight lookups, runtime parameter updates and a
//! periodic cache sweep. All cache and waiting-registry state is owned by
//! that task; callers interact through a clonable [`ResolverHandle`].
//!
//! # Resolution Flow
//!
//! ```text
//! ResolveRequest
//!      |
//!      v
//! cache has an address of the requested family?
//!      |
//!      +-- yes --> reply immediately (cache hit)
//!      |
//!      +-- no --> append to waiting registry for the name
//!                      |
//!                      +-- first waiter --> start ONE lookup for the name
//!                      +-- later waiters --> nothing; the lookup is shared
//!
//! lookup completes
//!      |
//!      +-- ok --> insert cache entry, drain waiters, per-waiter family
//!      |          selection (failure for waiters the list cannot satisfy)
//!      +-- err --> drain waiters with the error; cache untouched
//! ```
//!
//! Cache entries are immutable once inserted and live until a sweep finds
//! them older than the fixed 30-second TTL. Lookups are served positionally:
//! the first address of the requested family, in resolver order.

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::fmt;
use std::io;
use std::net::IpAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::net::lookup_host;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{self, Instant};
use tracing::{debug, info, trace};

/// Cache entries older than this are removed by the periodic sweep.
const RESOLVE_TTL: Duration = Duration::from_secs(30);

/// Requested address family.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IpFamily {
    V4,
    V6,
}

impl IpFamily {
    fn matches(self, addr: &IpAddr) -> bool {
        match self {
            IpFamily::V4 => addr.is_ipv4(),
            IpFamily::V6 => addr.is_ipv6(),
        }
    }
}

impl fmt::Display for IpFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IpFamily::V4 => write!(f, "IPv4"),
            IpFamily::V6 => write!(f, "IPv6"),
        }
    }
}

/// Identifier correlating a request with its reply.
pub type RequestId = u64;

/// Why a resolve request could not produce an address.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ResolveError {
    /// The name resolved, but to no address of the requested family.
    #[error("no {family} address for {name}")]
    NoAddressForFamily { name: String, family: IpFamily },

    /// The underlying lookup failed.
    #[error("{description}")]
    LookupFailed { description: String },
}

/// A name-resolution request delivered to the resolver agent.
#[derive(Debug)]
pub struct ResolveRequest {
    pub req_id: RequestId,
    /// Name to resolve; also the coalescing key.
    pub name: String,
    pub family: IpFamily,
    /// Opaque correlation value echoed back in the reply.
    pub completion_token: u64,
    /// Where the reply is delivered.
    pub reply_to: oneshot::Sender<ResolveReply>,
}

/// Reply to a [`ResolveRequest`].
#[derive(Debug)]
pub struct ResolveReply {
    pub req_id: RequestId,
    pub completion_token: u64,
    pub result: std::result::Result<IpAddr, ResolveError>,
}

/// Runtime-adjustable resolver parameters. Only the cache-cleanup period is
/// configurable at runtime; it takes effect at the next sweep re-schedule.
#[derive(Debug, Clone)]
pub struct DnsParamsUpdate {
    pub cache_cleanup_period: Duration,
}

/// Counters kept by the resolver agent.
#[derive(Debug, Default)]
pub struct DnsStats {
    cache_hits: AtomicU64,
    successful_lookups: AtomicU64,
    failed_lookups: AtomicU64,
}

impl DnsStats {
    pub fn cache_hits(&self) -> u64 {
        self.cache_hits.load(Ordering::Relaxed)
    }

    pub fn successful_lookups(&self) -> u64 {
        self.successful_lookups.load(Ordering::Relaxed)
    }

    pub fn failed_lookups(&self) -> u64 {
        self.failed_lookups.load(Ordering::Relaxed)
    }
}

/// Backend that turns a name into addresses.
#[async_trait]
pub trait NameLookup: Send + Sync + 'static {
    async fn lookup(&self, name: &str) -> io::Result<Vec<IpAddr>>;
}

/// System resolver backed by [`tokio::net::lookup_host`].
pub struct SystemLookup;

#[async_trait]
impl NameLookup for SystemLookup {
    async fn lookup(&self, name: &str) -> io::Result<Vec<IpAddr>> {
        // Port 0 keeps the service part numeric; only addresses are used.
        let addrs = lookup_host((name, 0u16)).await?;
        Ok(addrs.map(|sockaddr| sockaddr.ip()).collect())
    }
}

/// First address of the requested family, in list order.
///
/// Order is whatever the resolver returned; entries are not rotated.
fn select_address(addresses: &[IpAddr], family: IpFamily) -> Option<IpAddr> {
    addresses.iter().copied().find(|addr| family.matches(addr))
}

/// One immutable resolution result.
#[derive(Debug, Clone)]
struct CacheEntry {
    addresses: Vec<IpAddr>,
    created_at: Instant,
}

/// TTL-bounded name→addresses cache.
#[derive(Debug, Default)]
struct LocalCache {
    entries: HashMap<String, CacheEntry>,
}

impl LocalCache {
    /// First cached address of the requested family. A present entry with no
    /// matching address counts as a miss.
    fn resolve(&self, name: &str, family: IpFamily) -> Option<IpAddr> {
        self.entries
            .get(name)
            .and_then(|entry| select_address(&entry.addresses, family))
    }

    /// Replace the entry for `name` wholesale.
    fn insert(&mut self, name: String, addresses: Vec<IpAddr>) {
        self.entries.insert(
            name,
            CacheEntry {
                addresses,
                created_at: Instant::now(),
            },
        );
    }

    /// Drop entries older than `ttl`; returns how many were removed.
    fn remove_outdated(&mut self, ttl: Duration) -> usize {
        let now = Instant::now();
        let before = self.entries.len();
        self.entries
            .retain(|_, entry| now.duration_since(entry.created_at) <= ttl);
        before - self.entries.len()
    }

    fn len(&self) -> usize {
        self.entries.len()
    }
}

/// Pending requests per name while a lookup is in flight.
///
/// An entry exists for a name exactly while one lookup for it is
/// outstanding.
#[derive(Debug, Default)]
struct WaitingRegistry {
    entries: HashMap<String, Vec<ResolveRequest>>,
}

impl WaitingRegistry {
    /// Queue `request`; returns true when this was the first waiter for the
    /// name, i.e. a lookup must be started.
    fn add(&mut self, request: ResolveRequest) -> bool {
        match self.entries.entry(request.name.clone()) {
            Entry::Occupied(mut occupied) => {
                occupied.get_mut().push(request);
                false
            }
            Entry::Vacant(vacant) => {
                vacant.insert(vec![request]);
                true
            }
        }
    }

    /// Remove and return all waiters for `name`.
    fn drain(&mut self, name: &str) -> Vec<ResolveRequest> {
        self.entries.remove(name).unwrap_or_default()
    }

    fn len(&self) -> usize {
        self.entries.len()
    }
}

/// Configuration for the resolver agent.
#[derive(Debug, Clone)]
pub struct ResolverConfig {
    /// Cadence of cache sweeps that evict expired entries.
    pub cache_cleanup_period: Duration,
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            cache_cleanup_period: Duration::from_secs(10),
        }
    }
}

/// Completion of one in-flight lookup.
#[derive(Debug)]
struct LookupDone {
    name: String,
    outcome: io::Result<Vec<IpAddr>>,
}

/// The resolver agent. Owns the cache and the waiting registry; runs as one
/// task spawned by [`DnsResolver::spawn`].
pub struct DnsResolver {
    requests: mpsc::Receiver<ResolveRequest>,
    params: mpsc::Receiver<DnsParamsUpdate>,
    completions_tx: mpsc::Sender<LookupDone>,
    completions: mpsc::Receiver<LookupDone>,
    lookup: Arc<dyn NameLookup>,
    cache: LocalCache,
    waiting: WaitingRegistry,
    stats: Arc<DnsStats>,
    cleanup_period: Duration,
}

impl DnsResolver {
    /// Spawn the resolver agent with the system lookup backend.
    pub fn spawn(config: ResolverConfig) -> ResolverHandle {
        Self::spawn_with_lookup(config, Arc::new(SystemLookup))
    }

    /// Spawn the resolver agent with a custom lookup backend.
    pub fn spawn_with_lookup(config: ResolverConfig, lookup: Arc<dyn NameLookup>) -> ResolverHandle {
        let (requests_tx, requests_rx) = mpsc::channel(64);
        let (params_tx, params_rx) = mpsc::channel(4);
        let (completions_tx, completions_rx) = mpsc::channel(64);
        let stats = Arc::new(DnsStats::default());

        let resolver = DnsResolver {
            requests: requests_rx,
            params: params_rx,
            completions_tx,
            completions: completions_rx,
            lookup,
            cache: LocalCache::default(),
            waiting: WaitingRegistry::default(),
            stats: Arc::clone(&stats),
            cleanup_period: config.cache_cleanup_period,
        };
        tokio::spawn(resolver.run());

        ResolverHandle {
            requests: requests_tx,
            params: params_tx,
            stats,
            next_req_id: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Agent loop: mailbox, lookup completions, parameter updates and the
    /// periodic cache sweep. Exits when every request sender is gone.
    async fn run(mut self) {
        info!("dns resolver started");

        let sweep = time::sleep(self.cleanup_period);
        tokio::pin!(sweep);

        loop {
            tokio::select! {
                request = self.requests.recv() => match request {
                    Some(request) => self.on_resolve(request),
                    None => break,
                },
                Some(done) = self.completions.recv() => self.on_lookup_done(done),
                Some(update) = self.params.recv() => self.on_params_updated(update),
                () = sweep.as_mut() => {
                    self.on_clear_cache();
                    // Re-arm with the current period; an updated period takes
                    // effect here, at the re-schedule.
                    sweep.as_mut().reset(Instant::now() + self.cleanup_period);
                }
            }
        }

        info!("dns resolver shutdown completed");
    }

    fn on_resolve(&mut self, request: ResolveRequest) {
        debug!(
            req_id = request.req_id,
            name = %request.name,
            family = %request.family,
            "resolve request"
        );

        if let Some(address) = self.cache.resolve(&request.name, request.family) {
            debug!(
                req_id = request.req_id,
                name = %request.name,
                address = %address,
                "request resolved from cache"
            );
            self.stats.cache_hits.fetch_add(1, Ordering::Relaxed);
            send_reply(request, Ok(address));
            return;
        }

        self.add_to_waiting_and_resolve(request);
    }

    fn add_to_waiting_and_resolve(&mut self, request: ResolveRequest) {
        trace!(req_id = request.req_id, "request added to waiting list");

        let name = request.name.clone();
        let need_lookup = self.waiting.add(request);
        if need_lookup {
            let lookup = Arc::clone(&self.lookup);
            let completions = self.completions_tx.clone();
            tokio::spawn(async move {
                let outcome = lookup.lookup(&name).await;
                // The agent may be gone during shutdown; nothing to notify then.
                let _ = completions.send(LookupDone { name, outcome }).await;
            });
        }
    }

    fn on_lookup_done(&mut self, done: LookupDone) {
        match done.outcome {
            Ok(addresses) => {
                self.stats.successful_lookups.fetch_add(1, Ordering::Relaxed);
                debug!(name = %done.name, addresses = ?addresses, "domain resolved");

                self.cache.insert(done.name.clone(), addresses.clone());

                for request in self.waiting.drain(&done.name) {
                    let result = select_address(&addresses, request.family).ok_or_else(|| {
                        ResolveError::NoAddressForFamily {
                            name: request.name.clone(),
                            family: request.family,
                        }
                    });
                    send_reply(request, result);
                }
            }
            Err(e) => {
                self.stats.failed_lookups.fetch_add(1, Ordering::Relaxed);
                debug!(name = %done.name, error = %e, "domain resolution failed");

                let description = e.to_string();
                for request in self.waiting.drain(&done.name) {
                    send_reply(
                        request,
                        Err(ResolveError::LookupFailed {
                            description: description.clone(),
                        }),
                    );
                }
            }
        }
    }

    fn on_params_updated(&mut self, update: DnsParamsUpdate) {
        trace!(period = ?update.cache_cleanup_period, "dns params updated");
        self.cleanup_period = update.cache_cleanup_period;
    }

    fn on_clear_cache(&mut self) {
        let removed = self.cache.remove_outdated(RESOLVE_TTL);
        trace!(removed, remaining = self.cache.len(), "dns cache cleaned up");
    }
}

fn send_reply(request: ResolveRequest, result: std::result::Result<IpAddr, ResolveError>) {
    let req_id = request.req_id;
    let reply = ResolveReply {
        req_id,
        completion_token: request.completion_token,
        result,
    };
    // The requester may have given up waiting; a dropped reply is fine.
    if request.reply_to.send(reply).is_err() {
        trace!(req_id, "resolve reply dropped: requester gone");
    } else {
        trace!(req_id, "resolve reply sent");
    }
}

/// Clonable client for the resolver agent.
///
/// The agent shuts down once every handle (and with it every request
/// sender) is dropped.
#[derive(Clone)]
pub struct ResolverHandle {
    requests: mpsc::Sender<ResolveRequest>,
    params: mpsc::Sender<DnsParamsUpdate>,
    stats: Arc<DnsStats>,
    next_req_id: Arc<AtomicU64>,
}

impl ResolverHandle {
    /// Resolve `name` to one address of the requested family.
    ///
    /// # Errors
    /// * `ResolveError::NoAddressForFamily` - The name has no address of the
    ///   requested family.
    /// * `ResolveError::LookupFailed` - The lookup failed or the agent is
    ///   gone.
    pub async fn resolve(
        &self,
        name: &str,
        family: IpFamily,
    ) -> std::result::Result<IpAddr, ResolveError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        let req_id = self.next_req_id.fetch_add(1, Ordering::Relaxed);
        let request = ResolveRequest {
            req_id,
            name: name.to_string(),
            family,
            completion_token: req_id,
            reply_to: reply_tx,
        };
        self.submit(request).await.map_err(agent_gone)?;
        match reply_rx.await {
            Ok(reply) => reply.result,
            Err(_) => Err(agent_gone(())),
        }
    }

    /// Submit a prebuilt request. Callers managing their own ids and
    /// completion tokens receive the reply on `request.reply_to`.
    ///
    /// # Errors
    /// Returns the request back when the agent is gone.
    pub async fn submit(&self, request: ResolveRequest) -> std::result::Result<(), ResolveRequest> {
        self.requests
            .send(request)
            .await
            .map_err(|rejected| rejected.0)
    }

    /// Adjust runtime parameters; only the cache-cleanup period is tunable.
    /// The new period takes effect at the next sweep re-schedule.
    pub async fn update_params(&self, update: DnsParamsUpdate) {
        let _ = self.params.send(update).await;
    }

    /// Counter snapshot access.
    pub fn stats(&self) -> &DnsStats {
        &self.stats
    }
}

fn agent_gone<T>(_: T) -> ResolveError {
    ResolveError::LookupFailed {
        description: "resolver agent is gone".to_string(),
    }
}
