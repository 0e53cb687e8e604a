//! Behavior-level tests: headers serving, inventory filtering and
//! address gossip, without live sockets.

use std::sync::Arc;

use xds_chain::coinview::{CachedCoinView, DurableCoinView, COINVIEW_TABLES};
use xds_chain::rules::{header, integrity, partial, RuleEngine};
use xds_chain::stake::{StakeChain, STAKE_TABLES};
use xds_chain::store::{BlockStore, BLOCK_STORE_TABLES};
use xds_chain::ConsensusManager;
use xds_crypto::Hash;
use xds_network::addrman::AddressBook;
use xds_network::behavior::{AddressGossipBehavior, Behavior, ConsensusBehavior};
use xds_network::message::{BlockLocator, InvItem, NetworkMessage, TimestampedAddress};
use xds_network::message::NetworkAddress;
use xds_network::peer::{Direction, PeerHandle};
use xds_primitives::{BlockHeader, NetworkParams};
use xds_runtime::EventBus;
use xds_storage::{MemoryKv, SharedKv};

fn manager() -> Arc<ConsensusManager> {
    let params = NetworkParams::mainnet();

    let tables: Vec<&'static str> = COINVIEW_TABLES
        .iter()
        .chain(STAKE_TABLES)
        .chain(BLOCK_STORE_TABLES)
        .copied()
        .collect();

    let kv: SharedKv = Arc::new(MemoryKv::new(&tables));
    let durable = DurableCoinView::open(kv.clone(), params.genesis_hash).unwrap();
    let coinview = Arc::new(CachedCoinView::new(Arc::new(durable)).unwrap());

    let engine = RuleEngine::new(
        vec![
            Box::new(header::HeaderVersionRule),
            Box::new(header::CheckpointRule),
            Box::new(header::HeaderTimeRule),
        ],
        vec![
            Box::new(integrity::MerkleRootRule),
            Box::new(integrity::BlockSizeRule),
        ],
        vec![Box::new(partial::CoinbasePlacementRule)],
        vec![],
    );

    let clock = u64::from(params.genesis_time) + 1_000_000;

    Arc::new(
        ConsensusManager::new(
            params,
            engine,
            coinview,
            StakeChain::new(kv.clone()),
            BlockStore::new(kv),
            Arc::new(EventBus::new()),
        )
        .with_clock(move || clock),
    )
}

fn header_on(manager: &ConsensusManager, prev: Hash<32>, salt: u32) -> BlockHeader {
    let parent = manager.indexer().get_by_hash(&prev).unwrap();

    BlockHeader {
        version: 1,
        prev_hash: prev,
        merkle_root: Hash::new([salt as u8; 32]),
        time: parent.header.time + 16,
        bits: parent.header.bits,
        nonce: salt,
    }
}

fn peer() -> Arc<PeerHandle> {
    PeerHandle::detached(9, "203.0.113.7:38333".parse().unwrap(), Direction::Inbound)
}

#[test]
fn getheaders_serves_best_chain_after_locator() {
    let manager = manager();
    let peer = peer();

    // three connected headers become the best-known header chain
    let mut prev = manager.indexer().genesis().hash;
    let mut headers = Vec::new();
    for salt in 1..=3 {
        let header = header_on(&manager, prev, salt);
        prev = header.hash();
        headers.push(header);
    }
    manager.on_headers(peer.id, headers.clone()).unwrap();

    // the header chain is not the active chain yet; activate nothing
    // and serve from the indexer's best chain (genesis only)
    let mut behavior = ConsensusBehavior::new(manager.clone());
    let outcome = behavior.handle(
        &peer,
        &NetworkMessage::GetHeaders(BlockLocator {
            have: vec![manager.indexer().genesis().hash],
            stop: Hash::ZERO,
        }),
    );

    assert_eq!(outcome.replies.len(), 1);
    let NetworkMessage::Headers(served) = &outcome.replies[0] else {
        panic!("getheaders answers with headers");
    };
    assert!(served.is_empty(), "nothing above genesis is active yet");
}

#[test]
fn headers_message_triggers_body_download() {
    let manager = manager();
    let peer = peer();
    let mut behavior = ConsensusBehavior::new(manager.clone());

    let genesis = manager.indexer().genesis().hash;
    let first = header_on(&manager, genesis, 1);

    let outcome = behavior.handle(&peer, &NetworkMessage::Headers(vec![first]));

    assert_eq!(outcome.replies.len(), 1);
    let NetworkMessage::GetData(items) = &outcome.replies[0] else {
        panic!("new headers lead to a getdata");
    };
    assert_eq!(items.len(), 1);
    assert_eq!(items[0].hash, first.hash());
}

#[test]
fn known_inventory_not_requested_twice() {
    let manager = manager();
    let peer = peer();
    let mut behavior = ConsensusBehavior::new(manager.clone());

    let genesis = manager.indexer().genesis().hash;

    // genesis is fully validated: never requested
    let outcome = behavior.handle(
        &peer,
        &NetworkMessage::Inv(vec![InvItem::block(genesis)]),
    );
    assert!(outcome.replies.is_empty());

    // an unknown block is requested
    let outcome = behavior.handle(
        &peer,
        &NetworkMessage::Inv(vec![InvItem::block(Hash::new([0xab; 32]))]),
    );
    assert_eq!(outcome.replies.len(), 1);
}

#[test]
fn invalid_header_bans_sender() {
    let manager = manager();
    let peer = peer();
    let mut behavior = ConsensusBehavior::new(manager.clone());

    let genesis = manager.indexer().genesis().hash;
    let mut stale = header_on(&manager, genesis, 1);
    // violates time monotonicity
    stale.time = 0;

    let outcome = behavior.handle(&peer, &NetworkMessage::Headers(vec![stale]));
    assert!(outcome.ban_peer_secs.is_some());
    assert!(outcome.disconnect);
}

#[test]
fn address_gossip_round() {
    let book = Arc::new(AddressBook::new());
    let peer = peer();
    let mut behavior = AddressGossipBehavior::new(book.clone());

    // a flood of addresses lands in the book, attributed to the peer
    let stamped = TimestampedAddress {
        time: 1_600_000_000,
        address: NetworkAddress::from_socket("198.51.100.3:38333".parse().unwrap(), 1),
    };
    behavior.handle(&peer, &NetworkMessage::Addr(vec![stamped]));

    assert_eq!(book.len(), 1);
    let record = book
        .get(&"198.51.100.3:38333".parse().unwrap())
        .unwrap();
    assert_eq!(record.source, Some(peer.addr.ip()));

    // getaddr returns what we know
    let outcome = behavior.handle(&peer, &NetworkMessage::GetAddr);
    let NetworkMessage::Addr(served) = &outcome.replies[0] else {
        panic!("getaddr answers with addr");
    };
    assert_eq!(served.len(), 1);
}
