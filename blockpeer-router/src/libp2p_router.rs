use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use libp2p::{
    identify,
    kad::{self, store::MemoryStore},
    multiaddr::Protocol,
    swarm::NetworkBehaviour,
    Multiaddr, PeerId as Libp2pPeerId, SwarmBuilder,
};
use log::{debug, info, warn};
use tokio::sync::{mpsc, oneshot};

use crate::negative_cache::NegativeCache;
use crate::net::{Net, SharedClientNet};
use crate::router::{Error, NegativeCacheCallback, ResolveStream, Router};
use crate::types::{PeerEndpoint, PeerId};

#[derive(NetworkBehaviour)]
struct Behaviour {
    kad: kad::Behaviour<MemoryStore>,
    identify: identify::Behaviour,
}

pub struct Libp2pRouterConfig {
    pub listen_addr: Multiaddr,
    pub bootstrap_peers: Vec<(Libp2pPeerId, Multiaddr)>,
    /// Port the HTTP mirror listener binds to on every peer, used to turn a
    /// peer's advertised listen address into a mirror URL.
    pub http_port: u16,
    pub protocol_version: String,
    /// TTL for negative-cache entries (spec §4.2), operator-configured via
    /// `Config::negative_cache_ttl_secs`.
    pub negative_cache_ttl: std::time::Duration,
}

/// Kademlia's `GET_PROVIDERS` default replication factor is 20; this is
/// comfortably above that so a single query's results never overflow the
/// channel and look like a dropped receiver.
const RESOLVE_CHANNEL_CAPACITY: usize = 32;

enum Command {
    Provide {
        keys: Vec<String>,
        respond_to: oneshot::Sender<Result<(), Error>>,
    },
    Resolve {
        key: String,
        allow_self: bool,
        max_retries: usize,
        tx: mpsc::Sender<PeerEndpoint>,
    },
    Close,
}

/// Tracks one in-flight `resolve()` call across however many DHT queries it
/// takes. `max_retries` is a budget of queries (spec §4.2: "each retry
/// issues one DHT query"), not a cap on the number of endpoints returned.
struct ResolveState {
    key: String,
    tx: mpsc::Sender<PeerEndpoint>,
    allow_self: bool,
    max_retries: usize,
    queries_issued: usize,
    found_any: bool,
    seen: HashSet<Libp2pPeerId>,
}

/// Called when a `get_providers` query completes (with or without error).
/// Re-issues another query under a fresh `QueryId` while the budget allows
/// and nothing has been found yet; otherwise drops the state, which closes
/// the caller's channel by dropping its `tx`.
fn retry_or_close_resolve(
    swarm: &mut libp2p::Swarm<Behaviour>,
    resolve_senders: &mut HashMap<kad::QueryId, ResolveState>,
    id: kad::QueryId,
) {
    let Some(state) = resolve_senders.remove(&id) else {
        return;
    };
    if state.found_any || state.queries_issued >= state.max_retries {
        return;
    }
    let next_id = swarm
        .behaviour_mut()
        .kad
        .get_providers(state.key.clone().into_bytes().into());
    resolve_senders.insert(
        next_id,
        ResolveState {
            queries_issued: state.queries_issued + 1,
            ..state
        },
    );
}

/// DHT-backed `Router`, grounded on libp2p's conventional swarm-in-a-task
/// shape: a `Swarm<Behaviour>` driven by a single background task, commands
/// delivered over an mpsc channel, replies over oneshot (the same
/// request/response-over-channel idiom the teacher uses for its worker
/// pool, just with libp2p on the other end instead of a VM).
pub struct Libp2pRouter {
    self_id: PeerId,
    command_tx: mpsc::Sender<Command>,
    negative_cache: Arc<NegativeCache>,
    net: Arc<dyn Net>,
    task: Mutex<Option<tokio::task::JoinHandle<()>>>,
    /// Providers observed by in-flight and past `resolve` queries this
    /// session, for `lookup_key`'s in-memory-only contract. Not an
    /// authoritative DHT snapshot — just a local sighting cache.
    known_providers: Arc<Mutex<HashMap<String, Vec<PeerEndpoint>>>>,
}

impl Libp2pRouter {
    pub fn new(
        keypair: libp2p::identity::Keypair,
        config: Libp2pRouterConfig,
    ) -> Result<Self, Error> {
        let local_peer_id = Libp2pPeerId::from(keypair.public());
        let kad_store = MemoryStore::new(local_peer_id);
        let kad = kad::Behaviour::new(local_peer_id, kad_store);
        let identify = identify::Behaviour::new(identify::Config::new(
            config.protocol_version.clone(),
            keypair.public(),
        ));

        let mut swarm = SwarmBuilder::with_existing_identity(keypair)
            .with_tokio()
            .with_tcp(
                libp2p::tcp::Config::default(),
                libp2p::noise::Config::new,
                libp2p::yamux::Config::default,
            )
            .map_err(|e| Error::Transport(e.to_string()))?
            .with_dns()
            .map_err(|e| Error::Transport(e.to_string()))?
            .with_behaviour(|_| Behaviour { kad, identify })
            .map_err(|e| Error::Transport(e.to_string()))?
            .build();

        swarm
            .listen_on(config.listen_addr.clone())
            .map_err(|e| Error::Transport(e.to_string()))?;

        for (peer_id, addr) in &config.bootstrap_peers {
            swarm
                .behaviour_mut()
                .kad
                .add_address(peer_id, addr.clone());
        }
        if !config.bootstrap_peers.is_empty() {
            let _ = swarm.behaviour_mut().kad.bootstrap();
        }

        let (command_tx, command_rx) = mpsc::channel(128);
        let http_port = config.http_port;
        let known_providers = Arc::new(Mutex::new(HashMap::new()));
        let task = tokio::spawn(run_swarm(
            swarm,
            command_rx,
            http_port,
            known_providers.clone(),
        ));

        Ok(Self {
            self_id: local_peer_id.into(),
            command_tx,
            negative_cache: Arc::new(NegativeCache::new(config.negative_cache_ttl)),
            net: Arc::new(SharedClientNet::new()),
            task: Mutex::new(Some(task)),
            known_providers,
        })
    }
}

async fn run_swarm(
    mut swarm: libp2p::Swarm<Behaviour>,
    mut command_rx: mpsc::Receiver<Command>,
    http_port: u16,
    known_providers: Arc<Mutex<HashMap<String, Vec<PeerEndpoint>>>>,
) {
    use futures::StreamExt;
    use kad::{GetProvidersOk, QueryResult};
    use libp2p::swarm::SwarmEvent;

    let local_peer_id = *swarm.local_peer_id();
    let mut identify_table: HashMap<Libp2pPeerId, String> = HashMap::new();
    let mut provide_waiters: HashMap<kad::QueryId, oneshot::Sender<Result<(), Error>>> =
        HashMap::new();
    let mut resolve_senders: HashMap<kad::QueryId, ResolveState> = HashMap::new();

    loop {
        tokio::select! {
            cmd = command_rx.recv() => {
                let Some(cmd) = cmd else { break };
                match cmd {
                    Command::Provide { keys, respond_to } => {
                        let mut last_err = None;
                        for key in keys {
                            match swarm.behaviour_mut().kad.start_providing(key.into_bytes().into()) {
                                Ok(id) => {
                                    provide_waiters.insert(id, respond_to);
                                    break;
                                }
                                Err(e) => last_err = Some(e),
                            }
                        }
                        if let Some(e) = last_err {
                            warn!("start_providing failed: {e}");
                        }
                    }
                    Command::Resolve { key, allow_self, max_retries, tx } => {
                        let id = swarm
                            .behaviour_mut()
                            .kad
                            .get_providers(key.clone().into_bytes().into());
                        resolve_senders.insert(
                            id,
                            ResolveState {
                                key,
                                tx,
                                allow_self,
                                max_retries: max_retries.max(1),
                                queries_issued: 1,
                                found_any: false,
                                seen: HashSet::new(),
                            },
                        );
                    }
                    Command::Close => break,
                }
            }
            event = swarm.select_next_some() => {
                match event {
                    SwarmEvent::Behaviour(BehaviourEvent::Identify(identify::Event::Received { peer_id, info, .. })) => {
                        if let Some(host) = http_host_from_identify(&info, http_port) {
                            identify_table.insert(peer_id, host);
                        }
                    }
                    SwarmEvent::Behaviour(BehaviourEvent::Kad(kad::Event::OutboundQueryProgressed {
                        id,
                        result: QueryResult::StartProviding(result),
                        ..
                    })) => {
                        if let Some(respond_to) = provide_waiters.remove(&id) {
                            let result = result
                                .map(|_| ())
                                .map_err(|e| Error::Transport(e.to_string()));
                            let _ = respond_to.send(result);
                        }
                    }
                    SwarmEvent::Behaviour(BehaviourEvent::Kad(kad::Event::OutboundQueryProgressed {
                        id,
                        result: QueryResult::GetProviders(Ok(GetProvidersOk::FoundProviders { providers, .. })),
                        ..
                    })) => {
                        if let Some(state) = resolve_senders.get_mut(&id) {
                            for peer in providers {
                                if !state.allow_self && peer == local_peer_id {
                                    continue;
                                }
                                if !state.seen.insert(peer) {
                                    continue;
                                }
                                let host = identify_table.get(&peer).cloned();
                                if let Some(host) = host {
                                    state.found_any = true;
                                    let endpoint = PeerEndpoint { peer_id: peer.into(), http_host: host };
                                    known_providers
                                        .lock()
                                        .unwrap()
                                        .entry(state.key.clone())
                                        .or_default()
                                        .push(endpoint.clone());
                                    if state.tx.try_send(endpoint).is_err() {
                                        debug!("resolve receiver dropped, ending query {id:?}");
                                        resolve_senders.remove(&id);
                                        break;
                                    }
                                }
                            }
                        }
                    }
                    SwarmEvent::Behaviour(BehaviourEvent::Kad(kad::Event::OutboundQueryProgressed {
                        id,
                        result: QueryResult::GetProviders(Ok(GetProvidersOk::FinishedWithNoAdditionalRecord { .. })),
                        ..
                    })) => {
                        retry_or_close_resolve(&mut swarm, &mut resolve_senders, id);
                    }
                    SwarmEvent::Behaviour(BehaviourEvent::Kad(kad::Event::OutboundQueryProgressed {
                        id,
                        result: QueryResult::GetProviders(Err(e)),
                        ..
                    })) => {
                        warn!("get_providers query {id:?} failed: {e}");
                        retry_or_close_resolve(&mut swarm, &mut resolve_senders, id);
                    }
                    SwarmEvent::NewListenAddr { address, .. } => {
                        info!("listening on {address}");
                    }
                    _ => {}
                }
            }
        }
    }
}

fn http_host_from_identify(info: &identify::Info, http_port: u16) -> Option<String> {
    info.listen_addrs.iter().find_map(|addr| {
        for proto in addr.iter() {
            match proto {
                Protocol::Ip4(ip) => return Some(format!("http://{ip}:{http_port}")),
                Protocol::Ip6(ip) => return Some(format!("http://[{ip}]:{http_port}")),
                _ => continue,
            }
        }
        None
    })
}

#[async_trait]
impl Router for Libp2pRouter {
    async fn provide(&self, keys: &[String]) -> Result<(), Error> {
        let (respond_to, recv) = oneshot::channel();
        self.command_tx
            .send(Command::Provide {
                keys: keys.to_vec(),
                respond_to,
            })
            .await
            .map_err(|_| Error::Closed)?;
        recv.await.map_err(|_| Error::Closed)?
    }

    async fn resolve(&self, key: &str, allow_self: bool, max_retries: usize) -> ResolveStream {
        if self.negative_cache.contains(key) {
            return Box::pin(tokio_stream::empty());
        }
        // A query's provider count isn't bounded by max_retries (that's a
        // query-count budget, not a result cap), so size the buffer for a
        // single Kademlia response rather than the retry count.
        let (tx, rx) = mpsc::channel(RESOLVE_CHANNEL_CAPACITY);
        if self
            .command_tx
            .send(Command::Resolve {
                key: key.to_string(),
                allow_self,
                max_retries,
                tx,
            })
            .await
            .is_err()
        {
            return Box::pin(tokio_stream::empty());
        }
        let negative_cache = self.negative_cache.clone();
        let owned_key = key.to_string();
        let stream = tokio_stream::wrappers::ReceiverStream::new(rx);
        let instrumented = async_stream::stream! {
            let mut yielded = false;
            futures::pin_mut!(stream);
            use futures::StreamExt;
            while let Some(item) = stream.next().await {
                yielded = true;
                yield item;
            }
            if !yielded {
                negative_cache.insert(&owned_key);
            }
        };
        Box::pin(instrumented)
    }

    async fn resolve_with_negative_cache_callback(
        &self,
        key: &str,
        allow_self: bool,
        max_retries: usize,
    ) -> (ResolveStream, NegativeCacheCallback) {
        let stream = self.resolve(key, allow_self, max_retries).await;
        let negative_cache = self.negative_cache.clone();
        let owned_key = key.to_string();
        let callback: NegativeCacheCallback = Box::new(move || negative_cache.insert(&owned_key));
        (stream, callback)
    }

    fn lookup_key(&self, key: &str) -> Vec<PeerEndpoint> {
        self.known_providers
            .lock()
            .unwrap()
            .get(key)
            .cloned()
            .unwrap_or_default()
    }

    fn net(&self) -> Arc<dyn Net> {
        self.net.clone()
    }

    async fn close(&self) {
        let _ = self.command_tx.send(Command::Close).await;
        if let Some(task) = self.task.lock().unwrap().take() {
            let _ = task.await;
        }
    }
}

impl Libp2pRouter {
    pub fn self_id(&self) -> &PeerId {
        &self.self_id
    }
}
