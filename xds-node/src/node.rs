//! Wiring the node together.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tokio::net::TcpListener;
use tracing::{debug, info, warn};

use xds_chain::coinview::{CachedCoinView, CoinView, DurableCoinView, COINVIEW_TABLES};
use xds_chain::rules::RuleEngine;
use xds_chain::stake::{StakeChain, STAKE_TABLES};
use xds_chain::store::{BlockStore, HeaderTreeStore, BLOCK_STORE_TABLES, HEADER_TREE_TABLES};
use xds_chain::{ChainEvent, ConsensusManager};
use xds_mempool::Mempool;
use xds_network::addrman::AddressBook;
use xds_network::behavior::{
    AddressGossipBehavior, BehaviorStack, ConsensusBehavior, TxRelayBehavior,
};
use xds_network::message::{InvItem, NetworkMessage};
use xds_network::peer::{PeerHandle, PeerSession};
use xds_network::slots::{reserve_proven_header_slots, InboundPeerSummary, SlotDecision};
use xds_network::{Direction, PeerEvent, PeerId};
use xds_primitives::NetworkParams;
use xds_runtime::{EventBus, NodeLifetime, TaskSet};
use xds_storage::{KvStore, RocksKv, SharedKv, WriteBatch};

use crate::{DataFolder, FolderLock, NodeConfig, NodeError};

const COMMON_TABLE: &str = "common";
const NODE_VERSION: &str = env!("CARGO_PKG_VERSION");

fn now_unix() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

type PeerRegistry = Arc<RwLock<HashMap<PeerId, Arc<PeerHandle>>>>;

/// Shared handles every network task needs.
#[derive(Clone)]
struct Services {
    params: NetworkParams,
    manager: Arc<ConsensusManager>,
    mempool: Arc<Mempool>,
    coinview: Arc<CachedCoinView>,
    address_book: Arc<AddressBook>,
    peers: PeerRegistry,
    peer_events: Arc<EventBus<PeerEvent>>,
}

impl Services {
    fn behavior_stack(&self) -> BehaviorStack {
        let ban_book = self.address_book.clone();
        let relay_view: Arc<dyn CoinView> = self.coinview.clone();

        BehaviorStack::new(vec![
            Box::new(ConsensusBehavior::new(self.manager.clone())),
            Box::new(TxRelayBehavior::new(
                self.mempool.clone(),
                self.manager.clone(),
                relay_view,
            )),
            Box::new(AddressGossipBehavior::new(self.address_book.clone())),
        ])
        .with_ban_hook(Box::new(move |peer, ban_secs| {
            ban_book.ban(&peer.addr, now_unix() + ban_secs);
        }))
    }

    /// Register a handshaked session and spawn its message loop.
    fn adopt_session(&self, session: PeerSession, lifetime: &NodeLifetime) -> Arc<PeerHandle> {
        let session = session.with_events(self.peer_events.clone());
        let handle = session.handle();

        self.manager
            .report_peer_height(handle.id, handle.start_height().max(0) as u64);

        self.peers
            .write()
            .expect("lock is never poisoned")
            .insert(handle.id, handle.clone());

        let mut stack = self.behavior_stack();
        let peers = self.peers.clone();
        let lifetime = lifetime.clone();
        let peer_id = handle.id;

        tokio::spawn(async move {
            let _ = session.run(&mut stack, &lifetime).await;
            peers
                .write()
                .expect("lock is never poisoned")
                .remove(&peer_id);
        });

        handle
    }
}

/// A running full node.
pub struct Node {
    pub params: NetworkParams,
    pub manager: Arc<ConsensusManager>,
    pub mempool: Arc<Mempool>,
    pub coinview: Arc<CachedCoinView>,
    pub address_book: Arc<AddressBook>,
    pub events: Arc<EventBus<ChainEvent>>,
    pub peer_events: Arc<EventBus<PeerEvent>>,
    folder: DataFolder,
    peers: PeerRegistry,
    tasks: TaskSet,
    _lock: FolderLock,
}

impl Node {
    /// Open storage, restore state and launch the background tasks.
    pub async fn start(config: NodeConfig) -> Result<Self, NodeError> {
        let params = NetworkParams::mainnet();

        let folder = DataFolder::create(&config.data_dir)?;
        let lock = FolderLock::acquire(&folder)?;

        // one store per on-disk area
        let coinview_kv: SharedKv =
            Arc::new(RocksKv::open(&folder.coinview_dir(), COINVIEW_TABLES)?);
        let chain_tables: Vec<&'static str> = STAKE_TABLES
            .iter()
            .chain(HEADER_TREE_TABLES)
            .copied()
            .collect();
        let chain_kv: SharedKv = Arc::new(RocksKv::open(&folder.chain_dir(), &chain_tables)?);
        let blocks_kv: SharedKv =
            Arc::new(RocksKv::open(&folder.blocks_dir(), BLOCK_STORE_TABLES)?);
        let common_kv: SharedKv =
            Arc::new(RocksKv::open(&folder.common_dir(), &[COMMON_TABLE])?);

        record_node_version(&common_kv)?;

        let durable = DurableCoinView::open(coinview_kv, params.genesis_hash)?;
        let coinview = Arc::new(CachedCoinView::new(Arc::new(durable))?);

        let events = Arc::new(EventBus::new());
        let peer_events = Arc::new(EventBus::new());

        let header_tree = Arc::new(HeaderTreeStore::new(chain_kv.clone()));

        let manager = Arc::new(ConsensusManager::new(
            params.clone(),
            RuleEngine::standard(),
            coinview.clone(),
            StakeChain::new(chain_kv),
            BlockStore::new(blocks_kv),
            events.clone(),
        ));

        // rebuild the header tree saved by previous runs
        let mut restored_headers = 0;
        for (_, header) in header_tree.load_all()? {
            if manager.indexer().connect(header).is_ok() {
                restored_headers += 1;
            }
        }
        if restored_headers > 0 {
            info!(restored_headers, "header tree restored");
        }

        let mempool = Arc::new(
            Mempool::new(params.clone(), config.mempool_config()).with_events(events.clone()),
        );

        // chain events drive mempool reconciliation and header
        // persistence
        {
            let mempool = mempool.clone();
            let reconcile_view = coinview.clone();
            let header_tree = header_tree.clone();

            events.subscribe("mempool-reconcile", move |event: &ChainEvent| match event {
                ChainEvent::BlockConnected(connected) => {
                    mempool.on_block_connected(&connected.block);
                    if let Err(err) =
                        header_tree.put_header(connected.height, &connected.block.header)
                    {
                        warn!(?err, "failed to persist connected header");
                    }
                }
                ChainEvent::BlockDisconnected(disconnected) => {
                    mempool.on_block_disconnected(
                        &disconnected.block,
                        reconcile_view.as_ref(),
                        disconnected.height.saturating_sub(1),
                        now_unix(),
                    );
                }
                ChainEvent::TransactionReceived(_) => {}
            });
        }

        let address_book = Arc::new(AddressBook::load(&folder.peers_json()));
        for seed in &config.seed_peers {
            address_book.add_discovered(*seed, None, now_unix());
        }

        // restore the mempool snapshot through the acceptance pipeline
        if let Ok(bytes) = std::fs::read(folder.mempool_dat()) {
            let restored = mempool.restore(&bytes, coinview.as_ref(), manager.tip().height);
            info!(restored, "mempool snapshot replayed");
        }

        let lifetime = NodeLifetime::new();
        let mut tasks = TaskSet::new(lifetime.clone());
        let peers: PeerRegistry = Arc::new(RwLock::new(HashMap::new()));

        let services = Services {
            params: params.clone(),
            manager: manager.clone(),
            mempool: mempool.clone(),
            coinview: coinview.clone(),
            address_book: address_book.clone(),
            peers: peers.clone(),
            peer_events: peer_events.clone(),
        };

        if config.listen {
            Self::spawn_listener(&mut tasks, &config, services.clone()).await?;
        }
        Self::spawn_dialer(&mut tasks, &config, services.clone());

        // announce locally admitted transactions to every peer
        {
            let peers = peers.clone();
            events.subscribe("tx-announce", move |event: &ChainEvent| {
                if let ChainEvent::TransactionReceived(tx) = event {
                    let announcement = NetworkMessage::Inv(vec![InvItem::tx(tx.txid())]);
                    for peer in peers.read().expect("lock is never poisoned").values() {
                        peer.try_send(announcement.clone());
                    }
                }
            });
        }

        Self::spawn_schedulers(&mut tasks, &services, &folder);

        info!(tip = %manager.tip().hash, height = manager.tip().height, "node started");

        Ok(Self {
            params,
            manager,
            mempool,
            coinview,
            address_book,
            events,
            peer_events,
            folder,
            peers,
            tasks,
            _lock: lock,
        })
    }

    async fn spawn_listener(
        tasks: &mut TaskSet,
        config: &NodeConfig,
        services: Services,
    ) -> Result<(), NodeError> {
        let port = config.port(&services.params);
        let listener = TcpListener::bind(("0.0.0.0", port)).await?;
        info!(port, "listening for inbound peers");

        let max_inbound = config.max_inbound(&services.params);

        tasks.spawn("inbound-listener", move |lifetime| async move {
            loop {
                let session = tokio::select! {
                    session = PeerSession::accept(
                        &listener,
                        services.params.clone(),
                        services.manager.tip().height as i32,
                        &lifetime,
                    ) => session,
                    _ = lifetime.cancelled() => break,
                };

                let session = match session {
                    Ok(session) => session,
                    Err(xds_network::NetworkError::Cancelled(_)) => break,
                    Err(err) => {
                        debug!(?err, "inbound connection failed");
                        continue;
                    }
                };

                let handle = session.handle();

                let connected: Vec<InboundPeerSummary> = {
                    let registry = services.peers.read().expect("lock is never poisoned");

                    if registry.len() >= max_inbound {
                        debug!(peer = handle.id, "inbound slots exhausted");
                        continue;
                    }

                    registry
                        .values()
                        .map(|peer| InboundPeerSummary {
                            id: peer.id,
                            supports_proven_headers: peer.supports_proven_headers(),
                            start_height: peer.start_height(),
                        })
                        .collect()
                };

                // hold slots for proven-header capable peers
                match reserve_proven_header_slots(
                    &connected,
                    handle.supports_proven_headers(),
                    max_inbound,
                ) {
                    SlotDecision::Accept => {}
                    SlotDecision::EvictPeer(evicted) => {
                        let registry = services.peers.read().expect("lock is never poisoned");
                        if let Some(peer) = registry.get(&evicted) {
                            debug!(peer = evicted, "evicting legacy peer for a reserved slot");
                            peer.request_disconnect();
                        }
                    }
                    SlotDecision::RejectNewcomer => {
                        debug!(peer = handle.id, "rejecting legacy peer, slots reserved");
                        continue;
                    }
                }

                services
                    .address_book
                    .add_discovered(handle.addr, None, now_unix());
                services
                    .address_book
                    .mark_handshaked(&handle.addr, now_unix());

                services.adopt_session(session, &lifetime);
            }
        });

        Ok(())
    }

    /// Outbound dialing: keep the outbound slots filled from the
    /// address book and kick off header sync on every new session.
    fn spawn_dialer(tasks: &mut TaskSet, config: &NodeConfig, services: Services) {
        let max_outbound = config.max_outbound(&services.params);

        tasks.spawn("outbound-dialer", move |lifetime| async move {
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(Duration::from_secs(10)) => {}
                    _ = lifetime.cancelled() => break,
                }

                let (outbound_count, connected) = {
                    let registry = services.peers.read().expect("lock is never poisoned");
                    let outbound = registry
                        .values()
                        .filter(|peer| peer.direction == Direction::Outbound)
                        .count();
                    let addrs = registry.values().map(|peer| peer.addr).collect::<Vec<_>>();
                    (outbound, addrs)
                };

                if outbound_count >= max_outbound {
                    continue;
                }

                let Some(target) =
                    services.address_book.select_for_outbound(&connected, now_unix())
                else {
                    continue;
                };

                services.address_book.mark_attempt(&target, now_unix());
                services
                    .peer_events
                    .publish(PeerEvent::ConnectionAttempt { addr: target });

                let session = match PeerSession::connect(
                    target,
                    services.params.clone(),
                    services.manager.tip().height as i32,
                    &lifetime,
                )
                .await
                {
                    Ok(session) => session,
                    Err(err) => {
                        debug!(%target, ?err, "outbound connect failed");
                        services
                            .peer_events
                            .publish(PeerEvent::ConnectionAttemptFailed { addr: target });
                        continue;
                    }
                };

                services.address_book.mark_connected(&target, now_unix());
                services.address_book.mark_handshaked(&target, now_unix());

                let handle = services.adopt_session(session, &lifetime);

                // header-first sync starts immediately
                let locator = ConsensusBehavior::new(services.manager.clone()).our_locator();
                handle.try_send(NetworkMessage::GetHeaders(locator));
            }
        });
    }

    fn spawn_schedulers(tasks: &mut TaskSet, services: &Services, folder: &DataFolder) {
        // puller stall sweep: reassigned blocks go out as getdata
        {
            let manager = services.manager.clone();
            let peers = services.peers.clone();

            tasks.spawn("puller-sweep", move |lifetime| async move {
                loop {
                    tokio::select! {
                        _ = tokio::time::sleep(Duration::from_secs(5)) => {}
                        _ = lifetime.cancelled() => break,
                    }

                    let (orders, unreachable) =
                        manager.puller().check_stalls(std::time::Instant::now());

                    for (peer_id, hashes) in orders {
                        let registry = peers.read().expect("lock is never poisoned");
                        if let Some(handle) = registry.get(&peer_id) {
                            let items = hashes.into_iter().map(InvItem::block).collect();
                            handle.try_send(NetworkMessage::GetData(items));
                        }
                    }

                    for hash in unreachable {
                        warn!(%hash, "block unreachable, subtree abandoned");
                        manager.indexer().invalidate_subtree(&hash);
                    }
                }
            });
        }

        // periodic chain log
        {
            let manager = services.manager.clone();
            let mempool = services.mempool.clone();

            tasks.spawn("chain-log", move |lifetime| async move {
                loop {
                    tokio::select! {
                        _ = tokio::time::sleep(Duration::from_secs(30)) => {}
                        _ = lifetime.cancelled() => break,
                    }

                    let tip = manager.tip();
                    info!(
                        height = tip.height,
                        tip = %tip.hash,
                        ibd = manager.is_ibd(),
                        mempool = mempool.len(),
                        "chain status"
                    );
                }
            });
        }

        // mempool expiry
        {
            let mempool = services.mempool.clone();

            tasks.spawn("mempool-expiry", move |lifetime| async move {
                loop {
                    tokio::select! {
                        _ = tokio::time::sleep(Duration::from_secs(600)) => {}
                        _ = lifetime.cancelled() => break,
                    }

                    mempool.expire(now_unix());
                }
            });
        }

        // coinview flush keeps the durable layer close to the tip
        {
            let coinview = services.coinview.clone();

            tasks.spawn("coinview-flush", move |lifetime| async move {
                loop {
                    tokio::select! {
                        _ = tokio::time::sleep(Duration::from_secs(60)) => {}
                        _ = lifetime.cancelled() => break,
                    }

                    if let Err(err) = coinview.flush() {
                        warn!(%err, "coinview flush failed");
                    }
                }
            });
        }

        // address book snapshot
        {
            let address_book = services.address_book.clone();
            let path = folder.peers_json();

            tasks.spawn("peer-save", move |lifetime| async move {
                loop {
                    tokio::select! {
                        _ = tokio::time::sleep(Duration::from_secs(600)) => {}
                        _ = lifetime.cancelled() => break,
                    }

                    if let Err(err) = address_book.save(&path) {
                        warn!(?err, "failed to save address book");
                    }
                }
            });
        }
    }

    pub fn lifetime(&self) -> NodeLifetime {
        self.tasks.lifetime().clone()
    }

    pub fn connected_peer_count(&self) -> usize {
        self.peers.read().expect("lock is never poisoned").len()
    }

    /// Graceful shutdown: stop tasks, flush state, write snapshots.
    pub async fn shutdown(self) -> Result<(), NodeError> {
        info!("shutting down");

        self.tasks.shutdown().await;

        self.coinview.flush()?;
        self.address_book.save(&self.folder.peers_json())?;
        std::fs::write(self.folder.mempool_dat(), self.mempool.snapshot())?;

        info!("shutdown complete");
        Ok(())
    }
}

/// Keep the singleton node-version marker current.
fn record_node_version(kv: &SharedKv) -> Result<(), NodeError> {
    let previous = kv.get(COMMON_TABLE, b"version")?;

    if let Some(previous) = previous {
        let previous = String::from_utf8_lossy(&previous);
        if previous != NODE_VERSION {
            info!(%previous, current = NODE_VERSION, "node version changed");
        }
    }

    let mut batch = WriteBatch::new();
    batch.put(
        COMMON_TABLE,
        &b"version"[..],
        NODE_VERSION.as_bytes().to_vec().into_boxed_slice(),
    );
    kv.commit(batch)?;

    Ok(())
}
