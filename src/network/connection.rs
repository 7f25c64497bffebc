//! Connection state machine
//!
//! A `Connection` owns one session with a peer: it performs the
//! version/verack handshake, installs the bloom filter, answers pings,
//! requests announced inventory and fans decoded objects out to listeners.
//!
//! Reads, decoding and listener dispatch run in order on one tokio task.
//! Outbound messages are serialized by the write mutex. Filter settings sit
//! behind their own lock so reconfiguring the filter never waits on a send.

use crate::codec::Encodable;
use crate::crypto::{address_hash, AddressError, MerkleError, Sha256Hash, ADDRESS_HASH_LEN};
use crate::filter::{BloomFilter, FilterConfig};
use futures::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::codec::{FramedRead, FramedWrite};

use super::codec::{FramingError, MessageCodec};
use super::config::ConnectionConfig;
use super::listener::{
    BlockCallback, BlockEvent, ConnectionCallback, ConnectionEvent, ListenerId, ListenerRegistry,
    ListenerResult, TransactionCallback,
};
use super::message::{
    FilterLoad, FilteredBlock, GetData, Inv, Message, Ping, Pong, ProtocolMessage, RawMessage,
    Tx, Verack, Version, MIN_VERACK_VERSION,
};
use super::params::{NetworkParameters, ServiceFlags};
use super::types::{InventoryType, InventoryVector, NetAddress};

type Writer = FramedWrite<Box<dyn AsyncWrite + Send + Unpin>, MessageCodec>;

/// How long `disconnect` waits for the dispatch task before aborting it
const DISCONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Connection errors
#[derive(Error, Debug)]
pub enum ConnectionError {
    #[error("Already connected")]
    AlreadyConnected,
    #[error("Not connected")]
    NotConnected,
    #[error("Peer does not support bloom filters")]
    FilterNotSupported,
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Framing error: {0}")]
    Framing(#[from] FramingError),
    #[error("Invalid filter address: {0}")]
    Address(#[from] AddressError),
    #[error("Invalid merkleblock {block}: {source}")]
    InvalidMerkleBlock {
        block: Sha256Hash,
        #[source]
        source: MerkleError,
    },
}

/// Handshake progress of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    AwaitingVerack,
    Ready,
}

/// Per-session state, reset on every connect
#[derive(Debug, Default)]
struct Session {
    state: ConnectionState,
    peer: Option<SocketAddr>,
    peer_services: ServiceFlags,
    peer_user_agent: Option<String>,
    negotiated_version: Option<i32>,
    filter_loaded: bool,
}

#[derive(Debug, Default)]
struct FilterSettings {
    addresses: Vec<String>,
    hashes: Vec<[u8; ADDRESS_HASH_LEN]>,
    config: FilterConfig,
}

struct Inner {
    config: ConnectionConfig,
    writer: tokio::sync::Mutex<Option<Writer>>,
    filter: RwLock<FilterSettings>,
    session: Mutex<Session>,
    shutdown: AtomicBool,
    disconnect_emitted: AtomicBool,
    shutdown_tx: Mutex<Option<mpsc::Sender<()>>>,
    task: tokio::sync::Mutex<Option<JoinHandle<()>>>,
    connection_listeners: ListenerRegistry<ConnectionCallback>,
    transaction_listeners: ListenerRegistry<TransactionCallback>,
    block_listeners: ListenerRegistry<BlockCallback>,
}

/// Handle to a peer session; clones share the session
#[derive(Clone)]
pub struct Connection {
    inner: Arc<Inner>,
}

impl Connection {
    pub fn new(config: ConnectionConfig) -> Self {
        let filter = FilterSettings {
            config: config.filter,
            ..FilterSettings::default()
        };
        Self {
            inner: Arc::new(Inner {
                config,
                writer: tokio::sync::Mutex::new(None),
                filter: RwLock::new(filter),
                session: Mutex::new(Session::default()),
                shutdown: AtomicBool::new(false),
                disconnect_emitted: AtomicBool::new(false),
                shutdown_tx: Mutex::new(None),
                task: tokio::sync::Mutex::new(None),
                connection_listeners: ListenerRegistry::new(),
                transaction_listeners: ListenerRegistry::new(),
                block_listeners: ListenerRegistry::new(),
            }),
        }
    }

    pub fn for_network(network: NetworkParameters) -> Self {
        Self::new(ConnectionConfig::for_network(network))
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Open a TCP connection to `addr` and start the handshake
    pub async fn connect(&self, addr: SocketAddr) -> Result<(), ConnectionError> {
        self.claim_session(addr)?;
        log::info!("Connecting to {} on {}", addr, self.network());
        let stream = match dial(addr).await {
            Ok(stream) => stream,
            Err(e) => {
                log::error!("Failed to connect to {}: {}", addr, e);
                self.session().state = ConnectionState::Disconnected;
                return Err(e.into());
            }
        };
        self.start_session(stream, addr).await
    }

    /// Start a session over an already open transport.
    ///
    /// Emits `Connected`, sends our `version`, then spawns the dispatch task.
    pub async fn connect_with<S>(&self, stream: S, peer: SocketAddr) -> Result<(), ConnectionError>
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        self.claim_session(peer)?;
        self.start_session(stream, peer).await
    }

    /// Move a disconnected session to `Connecting`, or fail if one is live
    fn claim_session(&self, peer: SocketAddr) -> Result<(), ConnectionError> {
        let mut session = self.session();
        if session.state != ConnectionState::Disconnected {
            return Err(ConnectionError::AlreadyConnected);
        }
        *session = Session {
            state: ConnectionState::Connecting,
            peer: Some(peer),
            ..Session::default()
        };
        Ok(())
    }

    async fn start_session<S>(&self, stream: S, peer: SocketAddr) -> Result<(), ConnectionError>
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        self.inner.shutdown.store(false, Ordering::SeqCst);
        self.inner.disconnect_emitted.store(false, Ordering::SeqCst);

        let codec = MessageCodec::new(self.network().magic());
        let (read_half, write_half) = tokio::io::split(stream);
        let writer: Box<dyn AsyncWrite + Send + Unpin> = Box::new(write_half);
        *self.inner.writer.lock().await = Some(FramedWrite::new(writer, codec.clone()));
        let reader = FramedRead::new(read_half, codec);

        log::info!("Connected to {}", peer);
        self.emit_connection_event(ConnectionEvent::Connected);

        let version = Version::new(
            self.inner.config.protocol_version,
            NetAddress::new(peer, ServiceFlags::empty()),
            self.inner.config.user_agent.clone(),
            self.inner.config.start_height,
            !self.has_filter_addresses(),
        );
        if let Err(e) = self.send(&version).await {
            log::error!("Failed to send version to {}: {}", peer, e);
            self.teardown().await;
            return Err(e);
        }
        self.set_state(ConnectionState::AwaitingVerack);

        let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>(1);
        *lock(&self.inner.shutdown_tx) = Some(shutdown_tx);

        let connection = self.clone();
        let handle = tokio::spawn(async move {
            connection.run(reader, shutdown_rx).await;
        });
        *self.inner.task.lock().await = Some(handle);

        Ok(())
    }

    /// Stop the session and wait for the dispatch task to finish
    pub async fn disconnect(&self) -> Result<(), ConnectionError> {
        let handle = self.inner.task.lock().await.take();
        let Some(mut handle) = handle else {
            return Err(ConnectionError::NotConnected);
        };

        log::info!("Disconnecting from {:?}", self.peer_addr());
        self.inner.shutdown.store(true, Ordering::SeqCst);
        if let Some(tx) = lock(&self.inner.shutdown_tx).take() {
            // The loop may already be gone
            let _ = tx.try_send(());
        }

        match tokio::time::timeout(DISCONNECT_TIMEOUT, &mut handle).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                log::warn!("Dispatch task ended abnormally: {}", e);
                self.teardown().await;
            }
            Err(_) => {
                log::warn!(
                    "Dispatch task did not stop within {:?}, aborting",
                    DISCONNECT_TIMEOUT
                );
                handle.abort();
                // Joined so the task has released the writer before teardown takes it
                let _ = handle.await;
                self.teardown().await;
            }
        }
        Ok(())
    }

    async fn run<R>(self, mut reader: FramedRead<R, MessageCodec>, mut shutdown_rx: mpsc::Receiver<()>)
    where
        R: AsyncRead + Send + Unpin,
    {
        let result = loop {
            if self.is_shutting_down() {
                break Ok(());
            }

            let frame = tokio::select! {
                _ = shutdown_rx.recv() => break Ok(()),
                frame = reader.next() => frame,
            };
            let message = match frame {
                Some(Ok(message)) => message,
                Some(Err(e)) => break Err(ConnectionError::Framing(e)),
                None => {
                    log::info!("Peer {:?} closed the connection", self.peer_addr());
                    break Ok(());
                }
            };
            if self.is_shutting_down() {
                break Ok(());
            }

            // A reply stuck on a peer that stopped reading must not block shutdown
            let handled = tokio::select! {
                _ = shutdown_rx.recv() => break Ok(()),
                handled = self.handle_message(message) => handled,
            };
            if let Err(e) = handled {
                break Err(e);
            }
        };

        match result {
            Err(e) if self.is_shutting_down() => {
                log::debug!("Ignoring error during shutdown: {}", e);
            }
            Err(e) => log::error!("Connection to {:?} failed: {}", self.peer_addr(), e),
            Ok(()) => {}
        }

        drop(reader);
        self.teardown().await;
    }

    async fn teardown(&self) {
        if let Some(writer) = self.inner.writer.lock().await.take() {
            // Unflushed bytes are discarded; the peer may have stopped reading
            let mut transport = writer.into_inner();
            if let Err(e) = transport.shutdown().await {
                log::debug!("Error closing transport: {}", e);
            }
        }
        // Claimed before the state flips so a reconnect cannot inherit it
        let first = !self.inner.disconnect_emitted.swap(true, Ordering::SeqCst);
        {
            let mut session = self.session();
            session.state = ConnectionState::Disconnected;
            session.filter_loaded = false;
        }

        if first {
            log::info!("Disconnected from {:?}", self.peer_addr());
            self.emit_connection_event(ConnectionEvent::Disconnected);
        }
    }

    // =========================================================================
    // Inbound handling
    // =========================================================================

    async fn handle_message(&self, message: Message) -> Result<(), ConnectionError> {
        match message {
            Message::Version(version) => self.on_version(version).await,
            Message::Verack => self.on_verack().await,
            Message::Ping(ping) => self.on_ping(ping).await,
            Message::Inv(inv) => self.on_inv(inv).await,
            Message::Tx(tx) => {
                log::debug!("Received tx {}", tx.txid());
                self.inner
                    .transaction_listeners
                    .notify("transaction", |listener| listener(&tx, self));
                Ok(())
            }
            Message::Block(block) => {
                log::debug!("Received block {}", block.hash());
                self.emit_block_event(BlockEvent::Full(block));
                Ok(())
            }
            Message::MerkleBlock(merkle_block) => {
                let block = merkle_block.hash();
                let filtered = FilteredBlock::try_from(merkle_block)
                    .map_err(|source| ConnectionError::InvalidMerkleBlock { block, source })?;
                log::debug!(
                    "Received merkleblock {} with {} matches",
                    block,
                    filtered.matched_tx_ids.len()
                );
                self.emit_block_event(BlockEvent::Filtered(filtered));
                Ok(())
            }
        }
    }

    async fn on_version(&self, version: Version) -> Result<(), ConnectionError> {
        let negotiated = version.version.min(self.inner.config.protocol_version);
        {
            let mut session = self.session();
            session.peer_services = version.services;
            session.peer_user_agent = Some(version.user_agent.clone());
            session.negotiated_version = Some(negotiated);
        }
        log::info!(
            "Peer {} version {} (services {:#x}, height {}), negotiated {}",
            version.user_agent,
            version.version,
            version.services.bits(),
            version.start_height,
            negotiated
        );

        if negotiated >= MIN_VERACK_VERSION {
            self.send(&Verack).await?;
        }
        Ok(())
    }

    async fn on_verack(&self) -> Result<(), ConnectionError> {
        self.set_state(ConnectionState::Ready);
        log::info!("Handshake with {:?} complete", self.peer_addr());
        self.emit_connection_event(ConnectionEvent::Verack);

        if self.has_filter_addresses() {
            self.load_filter().await?;
        }
        Ok(())
    }

    async fn on_ping(&self, ping: Ping) -> Result<(), ConnectionError> {
        match ping.nonce {
            Some(nonce) => self.send(&Pong { nonce }).await,
            None => Ok(()),
        }
    }

    async fn on_inv(&self, inv: Inv) -> Result<(), ConnectionError> {
        let filtered = self.session().filter_loaded;
        let inventory: Vec<InventoryVector> = inv
            .inventory
            .into_iter()
            .filter_map(|item| match item.inv_type {
                InventoryType::Tx => Some(item),
                InventoryType::Block if filtered => {
                    Some(InventoryVector::new(InventoryType::FilteredBlock, item.hash))
                }
                InventoryType::Block => Some(item),
                _ => None,
            })
            .collect();

        if inventory.is_empty() {
            return Ok(());
        }
        log::debug!("Requesting {} inventory items", inventory.len());
        self.send(&GetData { inventory }).await
    }

    // =========================================================================
    // Outbound
    // =========================================================================

    /// Send any encodable message; write errors are returned to the caller
    pub async fn send<M>(&self, message: &M) -> Result<(), ConnectionError>
    where
        M: ProtocolMessage + Encodable,
    {
        let raw = RawMessage::from_message(message);
        let mut writer = self.inner.writer.lock().await;
        let writer = writer.as_mut().ok_or(ConnectionError::NotConnected)?;
        writer.send(raw).await?;
        Ok(())
    }

    /// Build a filter from the configured addresses and send it as `filterload`
    pub async fn load_filter(&self) -> Result<(), ConnectionError> {
        {
            let session = self.session();
            if session.state != ConnectionState::Ready {
                return Err(ConnectionError::NotConnected);
            }
            if !session.peer_services.contains(ServiceFlags::NODE_BLOOM) {
                return Err(ConnectionError::FilterNotSupported);
            }
        }

        let message = {
            let settings = read(&self.inner.filter);
            if settings.hashes.is_empty() {
                log::debug!("No filter addresses configured, not loading a filter");
                return Ok(());
            }
            let mut filter = BloomFilter::with_random_tweak(
                settings.hashes.len(),
                settings.config.false_positive_rate,
            );
            for hash in &settings.hashes {
                filter.insert(hash);
            }
            log::info!(
                "Loading filter: {} addresses, {} bytes, {} hash functions",
                settings.hashes.len(),
                filter.size_bytes(),
                filter.num_hash_funcs()
            );
            FilterLoad::from_filter(&filter, settings.config.update_flags)
        };

        self.send(&message).await?;
        self.session().filter_loaded = true;
        Ok(())
    }

    // =========================================================================
    // Filter settings
    // =========================================================================

    /// Replace the filter address list; every address must decode to a 20-byte hash
    pub fn set_filter_list(&self, addresses: Vec<String>) -> Result<(), ConnectionError> {
        let hashes = addresses
            .iter()
            .map(|address| address_hash(address))
            .collect::<Result<Vec<_>, _>>()?;
        let mut settings = write(&self.inner.filter);
        settings.addresses = addresses;
        settings.hashes = hashes;
        Ok(())
    }

    pub fn filter_list(&self) -> Vec<String> {
        read(&self.inner.filter).addresses.clone()
    }

    pub fn has_filter_addresses(&self) -> bool {
        !read(&self.inner.filter).hashes.is_empty()
    }

    pub fn filter_config(&self) -> FilterConfig {
        read(&self.inner.filter).config
    }

    pub fn set_filter_config(&self, config: FilterConfig) {
        write(&self.inner.filter).config = config;
    }

    // =========================================================================
    // Listeners
    // =========================================================================

    pub fn on_connection_event<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(ConnectionEvent, &Connection) -> ListenerResult + Send + Sync + 'static,
    {
        self.inner.connection_listeners.add(Arc::new(listener))
    }

    pub fn on_transaction<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(&Tx, &Connection) -> ListenerResult + Send + Sync + 'static,
    {
        self.inner.transaction_listeners.add(Arc::new(listener))
    }

    pub fn on_block<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(&BlockEvent, &Connection) -> ListenerResult + Send + Sync + 'static,
    {
        self.inner.block_listeners.add(Arc::new(listener))
    }

    /// Unregister a listener of any kind
    pub fn remove_listener(&self, id: ListenerId) -> bool {
        self.inner.connection_listeners.remove(id)
            || self.inner.transaction_listeners.remove(id)
            || self.inner.block_listeners.remove(id)
    }

    // =========================================================================
    // Accessors
    // =========================================================================

    pub fn config(&self) -> &ConnectionConfig {
        &self.inner.config
    }

    pub fn network(&self) -> NetworkParameters {
        self.inner.config.network
    }

    pub fn state(&self) -> ConnectionState {
        self.session().state
    }

    pub fn is_connected(&self) -> bool {
        self.state() != ConnectionState::Disconnected
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.session().peer
    }

    pub fn peer_services(&self) -> ServiceFlags {
        self.session().peer_services
    }

    pub fn peer_user_agent(&self) -> Option<String> {
        self.session().peer_user_agent.clone()
    }

    /// min(ours, peer's), known once the peer's `version` arrived
    pub fn negotiated_version(&self) -> Option<i32> {
        self.session().negotiated_version
    }

    // Private helpers

    fn session(&self) -> MutexGuard<'_, Session> {
        lock(&self.inner.session)
    }

    fn set_state(&self, state: ConnectionState) {
        let mut session = self.session();
        // A teardown that already ran wins
        if session.state != ConnectionState::Disconnected {
            session.state = state;
        }
    }

    fn is_shutting_down(&self) -> bool {
        self.inner.shutdown.load(Ordering::SeqCst)
    }

    fn emit_connection_event(&self, event: ConnectionEvent) {
        self.inner
            .connection_listeners
            .notify("connection", |listener| listener(event, self));
    }

    fn emit_block_event(&self, event: BlockEvent) {
        self.inner
            .block_listeners
            .notify("block", |listener| listener(&event, self));
    }
}

async fn dial(addr: SocketAddr) -> std::io::Result<TcpStream> {
    let stream = TcpStream::connect(addr).await?;
    stream.set_nodelay(true)?;
    Ok(stream)
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

fn read<T>(lock: &RwLock<T>) -> std::sync::RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(|e| e.into_inner())
}

fn write<T>(lock: &RwLock<T>) -> std::sync::RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(|e| e.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{Decodable, WireBuffer};
    use crate::network::codec::HEADER_SIZE;
    use std::pin::Pin;
    use std::sync::atomic::AtomicUsize;
    use std::task::{Context, Poll};
    use tokio::io::{AsyncReadExt, DuplexStream, ReadBuf};
    use tokio_util::codec::Encoder;

    const GENESIS_HEADER: &str = "0100000000000000000000000000000000000000000000000000000000000000000000003ba3edfd7a7b12b27ac72c3e67768f617fc81bc3888a51323a9fb8aa4b1e5e4a29ab5f49ffff001d1dac2b7c";

    const FILTER_ADDRESS: &str = "mxq6Fg4ygVU8tdHRvUifPzQFsQJX4XEamF";

    /// The remote end of a duplex transport, speaking raw frames
    struct MockPeer {
        stream: DuplexStream,
        codec: MessageCodec,
    }

    impl MockPeer {
        async fn send(&mut self, command: &str, payload: Vec<u8>) {
            let mut out = bytes::BytesMut::new();
            self.codec
                .encode(RawMessage::new(command, payload), &mut out)
                .unwrap();
            self.stream.write_all(&out).await.unwrap();
        }

        async fn recv(&mut self) -> (String, Vec<u8>) {
            let mut header = [0u8; HEADER_SIZE];
            tokio::time::timeout(Duration::from_secs(2), self.stream.read_exact(&mut header))
                .await
                .expect("timed out waiting for a frame")
                .unwrap();
            let mut buf = WireBuffer::wrap(header[4..].to_vec());
            let command = buf.get_string(12).unwrap();
            let length = buf.get_u32().unwrap() as usize;
            let mut payload = vec![0u8; length];
            self.stream.read_exact(&mut payload).await.unwrap();
            (command, payload)
        }

        async fn send_version(&mut self, services: ServiceFlags) {
            let mut version = Version::new(
                70015,
                NetAddress::unspecified(ServiceFlags::empty()),
                "/mock:1.0/",
                100,
                true,
            );
            version.services = services;
            self.send("version", version.to_wire_bytes()).await;
        }

        /// Complete the handshake and consume our verack
        async fn handshake(&mut self, services: ServiceFlags) {
            let (command, _) = self.recv().await;
            assert_eq!(command, "version");
            self.send_version(services).await;
            self.send("verack", vec![]).await;
            let (command, _) = self.recv().await;
            assert_eq!(command, "verack");
        }
    }

    /// Transport whose writes fail with `BrokenPipe` once `broken` is set
    struct FailingWrites {
        inner: DuplexStream,
        broken: Arc<AtomicBool>,
    }

    impl AsyncRead for FailingWrites {
        fn poll_read(
            mut self: Pin<&mut Self>,
            cx: &mut Context<'_>,
            buf: &mut ReadBuf<'_>,
        ) -> Poll<std::io::Result<()>> {
            Pin::new(&mut self.inner).poll_read(cx, buf)
        }
    }

    impl AsyncWrite for FailingWrites {
        fn poll_write(
            mut self: Pin<&mut Self>,
            cx: &mut Context<'_>,
            buf: &[u8],
        ) -> Poll<std::io::Result<usize>> {
            if self.broken.load(Ordering::SeqCst) {
                return Poll::Ready(Err(std::io::ErrorKind::BrokenPipe.into()));
            }
            Pin::new(&mut self.inner).poll_write(cx, buf)
        }

        fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
            Pin::new(&mut self.inner).poll_flush(cx)
        }

        fn poll_shutdown(
            mut self: Pin<&mut Self>,
            cx: &mut Context<'_>,
        ) -> Poll<std::io::Result<()>> {
            Pin::new(&mut self.inner).poll_shutdown(cx)
        }
    }

    fn peer_addr() -> SocketAddr {
        "127.0.0.1:18444".parse().unwrap()
    }

    async fn start(connection: &Connection) -> MockPeer {
        let (client, server) = tokio::io::duplex(64 * 1024);
        connection.connect_with(client, peer_addr()).await.unwrap();
        MockPeer {
            stream: server,
            codec: MessageCodec::new(connection.network().magic()),
        }
    }

    fn record_events(connection: &Connection) -> Arc<Mutex<Vec<ConnectionEvent>>> {
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = events.clone();
        connection.on_connection_event(move |event, _| {
            sink.lock().unwrap().push(event);
            Ok(())
        });
        events
    }

    async fn wait_for(condition: impl Fn() -> bool) {
        tokio::time::timeout(Duration::from_secs(2), async {
            while !condition() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("condition not reached");
    }

    fn inv_payload(items: &[(u32, [u8; 32])]) -> Vec<u8> {
        let mut buf = WireBuffer::with_capacity(0);
        buf.put_varint(items.len() as u64);
        for (inv_type, hash) in items {
            buf.put_u32(*inv_type);
            buf.put_bytes(hash);
        }
        buf.into_bytes()
    }

    fn merkle_block_payload(txid_wire: [u8; 32]) -> Vec<u8> {
        let mut buf = WireBuffer::wrap(hex::decode(GENESIS_HEADER).unwrap());
        buf.set_position(80);
        buf.put_u32(1);
        buf.put_varint(1);
        buf.put_bytes(&txid_wire);
        buf.put_var_bytes(&[0x01]);
        buf.into_bytes()
    }

    fn disconnected_count(events: &Mutex<Vec<ConnectionEvent>>) -> usize {
        events
            .lock()
            .unwrap()
            .iter()
            .filter(|e| **e == ConnectionEvent::Disconnected)
            .count()
    }

    fn genesis_txid() -> Sha256Hash {
        Sha256Hash::from_hex("4a5e1e4baab89f3a32518a88c31bc87f618f76673e2cc77ab2127b7afdeda33b")
            .unwrap()
    }

    #[tokio::test]
    async fn test_handshake() {
        let connection = Connection::for_network(NetworkParameters::Regtest);
        let events = record_events(&connection);
        let mut peer = start(&connection).await;

        let (command, payload) = peer.recv().await;
        assert_eq!(command, "version");
        let version = Version::from_wire_bytes(&payload).unwrap();
        assert_eq!(version.version, 70015);
        assert!(version.relay);
        assert_eq!(version.addr_recv.socket_addr(), peer_addr());

        peer.send_version(ServiceFlags::NODE_NETWORK).await;
        peer.send("verack", vec![]).await;
        let (command, payload) = peer.recv().await;
        assert_eq!(command, "verack");
        assert!(payload.is_empty());

        wait_for(|| events.lock().unwrap().len() == 2).await;
        assert_eq!(
            *events.lock().unwrap(),
            vec![ConnectionEvent::Connected, ConnectionEvent::Verack]
        );
        assert_eq!(connection.state(), ConnectionState::Ready);
        assert_eq!(connection.negotiated_version(), Some(70015));
        assert_eq!(connection.peer_user_agent().as_deref(), Some("/mock:1.0/"));

        connection.disconnect().await.unwrap();
        assert_eq!(
            *events.lock().unwrap(),
            vec![
                ConnectionEvent::Connected,
                ConnectionEvent::Verack,
                ConnectionEvent::Disconnected
            ]
        );
        assert!(!connection.is_connected());

        // Nothing else was written
        let mut rest = Vec::new();
        peer.stream.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty());
    }

    #[tokio::test]
    async fn test_old_peer_gets_no_verack() {
        let connection = Connection::for_network(NetworkParameters::Regtest);
        let mut peer = start(&connection).await;
        peer.recv().await;

        let mut version = Version::new(
            106,
            NetAddress::unspecified(ServiceFlags::empty()),
            "",
            0,
            true,
        );
        version.services = ServiceFlags::NODE_NETWORK;
        peer.send("version", version.to_wire_bytes()).await;
        peer.send("ping", 3u64.to_le_bytes().to_vec()).await;

        // The first reply is the pong, no verack before it
        let (command, _) = peer.recv().await;
        assert_eq!(command, "pong");
        assert_eq!(connection.negotiated_version(), Some(106));
        connection.disconnect().await.unwrap();
    }

    #[tokio::test]
    async fn test_filter_loaded_after_verack() {
        let connection = Connection::for_network(NetworkParameters::Testnet3);
        connection
            .set_filter_list(vec![FILTER_ADDRESS.to_string()])
            .unwrap();
        let mut peer = start(&connection).await;

        let (command, payload) = peer.recv().await;
        assert_eq!(command, "version");
        assert!(!Version::from_wire_bytes(&payload).unwrap().relay);

        peer.send_version(ServiceFlags::NODE_NETWORK | ServiceFlags::NODE_BLOOM)
            .await;
        peer.send("verack", vec![]).await;
        assert_eq!(peer.recv().await.0, "verack");

        let (command, payload) = peer.recv().await;
        assert_eq!(command, "filterload");
        let mut buf = WireBuffer::wrap(payload);
        let filter = buf.get_var_bytes().unwrap();
        assert_eq!(filter.len(), BloomFilter::new(1, 0.0001, 0).size_bytes());
        let num_hash_funcs = buf.get_u32().unwrap();
        let tweak = buf.get_u32().unwrap();
        assert_eq!(buf.get_u8().unwrap(), 2);

        // The filter the peer received matches our address hash
        let hash = address_hash(FILTER_ADDRESS).unwrap();
        let mut expected = BloomFilter::new(1, 0.0001, tweak);
        expected.insert(&hash);
        assert_eq!(expected.as_bytes(), filter.as_slice());
        assert_eq!(expected.num_hash_funcs(), num_hash_funcs);

        connection.disconnect().await.unwrap();
    }

    #[tokio::test]
    async fn test_filter_requires_bloom_service() {
        let connection = Connection::for_network(NetworkParameters::Testnet3);
        connection
            .set_filter_list(vec![FILTER_ADDRESS.to_string()])
            .unwrap();
        let events = record_events(&connection);
        let mut peer = start(&connection).await;

        peer.handshake(ServiceFlags::NODE_NETWORK).await;

        wait_for(|| events.lock().unwrap().contains(&ConnectionEvent::Disconnected)).await;
        assert!(!connection.is_connected());
        let mut rest = Vec::new();
        peer.stream.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty());
    }

    #[tokio::test]
    async fn test_inv_requests_filtered_blocks() {
        let connection = Connection::for_network(NetworkParameters::Testnet3);
        connection
            .set_filter_list(vec![FILTER_ADDRESS.to_string()])
            .unwrap();
        let mut peer = start(&connection).await;
        peer.handshake(ServiceFlags::NODE_BLOOM).await;
        assert_eq!(peer.recv().await.0, "filterload");

        peer.send(
            "inv",
            inv_payload(&[(1, [0x11; 32]), (2, [0x22; 32]), (0x4000_0001, [0x33; 32])]),
        )
        .await;

        let (command, payload) = peer.recv().await;
        assert_eq!(command, "getdata");
        let mut buf = WireBuffer::wrap(payload);
        let requested: Vec<InventoryVector> = buf.get_vector().unwrap();
        assert_eq!(
            requested,
            vec![
                InventoryVector::new(InventoryType::Tx, Sha256Hash::from_bytes([0x11; 32])),
                InventoryVector::new(
                    InventoryType::FilteredBlock,
                    Sha256Hash::from_bytes([0x22; 32])
                ),
            ]
        );
        connection.disconnect().await.unwrap();
    }

    #[tokio::test]
    async fn test_inv_without_filter_requests_blocks() {
        let connection = Connection::for_network(NetworkParameters::Regtest);
        let mut peer = start(&connection).await;
        peer.handshake(ServiceFlags::NODE_NETWORK).await;

        peer.send("inv", inv_payload(&[(2, [0x22; 32])])).await;
        let (command, payload) = peer.recv().await;
        assert_eq!(command, "getdata");
        assert_eq!(&payload[..5], &[1, 2, 0, 0, 0]);
        connection.disconnect().await.unwrap();
    }

    #[tokio::test]
    async fn test_ping_pong() {
        let connection = Connection::for_network(NetworkParameters::Regtest);
        let mut peer = start(&connection).await;
        peer.handshake(ServiceFlags::NODE_NETWORK).await;

        // A nonce-less ping gets no reply
        peer.send("ping", vec![]).await;
        peer.send("ping", 0xDEAD_BEEFu64.to_le_bytes().to_vec()).await;

        let (command, payload) = peer.recv().await;
        assert_eq!(command, "pong");
        assert_eq!(payload, 0xDEAD_BEEFu64.to_le_bytes().to_vec());
        connection.disconnect().await.unwrap();
    }

    #[tokio::test]
    async fn test_listener_isolation() {
        let connection = Connection::for_network(NetworkParameters::Regtest);
        let received = Arc::new(AtomicUsize::new(0));

        connection.on_transaction(|_, _| Err("listener failure".into()));
        connection.on_transaction(|_, _| panic!("listener panic"));
        let counter = received.clone();
        connection.on_transaction(move |tx, _| {
            assert!(tx.is_coinbase());
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

        let mut peer = start(&connection).await;
        peer.handshake(ServiceFlags::NODE_NETWORK).await;

        let coinbase = hex::decode(
            "01000000010000000000000000000000000000000000000000000000000000000000000000ffffffff0704ffff001d0104ffffffff0100f2052a010000000000000000",
        )
        .unwrap();
        peer.send("tx", coinbase.clone()).await;
        peer.send("tx", coinbase).await;

        wait_for(|| received.load(Ordering::SeqCst) == 2).await;
        assert!(connection.is_connected());
        connection.disconnect().await.unwrap();
    }

    #[tokio::test]
    async fn test_verified_merkle_block_delivered() {
        let connection = Connection::for_network(NetworkParameters::Regtest);
        let blocks = Arc::new(Mutex::new(Vec::new()));
        let sink = blocks.clone();
        connection.on_block(move |event, _| {
            sink.lock().unwrap().push(event.clone());
            Ok(())
        });

        let mut peer = start(&connection).await;
        peer.handshake(ServiceFlags::NODE_NETWORK).await;
        peer.send("merkleblock", merkle_block_payload(*genesis_txid().as_bytes()))
            .await;

        wait_for(|| blocks.lock().unwrap().len() == 1).await;
        match &blocks.lock().unwrap()[0] {
            BlockEvent::Filtered(block) => {
                assert_eq!(block.matched_tx_ids, vec![genesis_txid()]);
            }
            other => panic!("unexpected event {:?}", other),
        }
        connection.disconnect().await.unwrap();
    }

    #[tokio::test]
    async fn test_invalid_merkle_block_tears_down() {
        let connection = Connection::for_network(NetworkParameters::Regtest);
        let events = record_events(&connection);
        let delivered = Arc::new(AtomicUsize::new(0));
        let counter = delivered.clone();
        connection.on_block(move |_, _| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

        let mut peer = start(&connection).await;
        peer.handshake(ServiceFlags::NODE_NETWORK).await;
        peer.send("merkleblock", merkle_block_payload([0x44; 32])).await;

        wait_for(|| events.lock().unwrap().contains(&ConnectionEvent::Disconnected)).await;
        assert_eq!(delivered.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_magic_mismatch_disconnects() {
        let connection = Connection::for_network(NetworkParameters::Regtest);
        let events = record_events(&connection);
        let mut peer = start(&connection).await;
        peer.recv().await;

        peer.codec = MessageCodec::new(NetworkParameters::Mainnet.magic());
        peer.send("verack", vec![]).await;

        wait_for(|| events.lock().unwrap().contains(&ConnectionEvent::Disconnected)).await;
        assert_eq!(disconnected_count(&events), 1);
        // Session is over; disconnect just reaps the finished task
        connection.disconnect().await.unwrap();
        assert_eq!(events.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_reconnect_resets_session() {
        let connection = Connection::for_network(NetworkParameters::Regtest);
        let mut peer = start(&connection).await;
        peer.handshake(ServiceFlags::NODE_BLOOM).await;
        assert!(connection.peer_services().contains(ServiceFlags::NODE_BLOOM));

        let (client, _server) = tokio::io::duplex(1024);
        assert!(matches!(
            connection.connect_with(client, peer_addr()).await,
            Err(ConnectionError::AlreadyConnected)
        ));

        connection.disconnect().await.unwrap();
        assert!(matches!(
            connection.disconnect().await,
            Err(ConnectionError::NotConnected)
        ));

        let mut peer = start(&connection).await;
        assert_eq!(connection.peer_services(), ServiceFlags::empty());
        assert_eq!(connection.negotiated_version(), None);
        assert_eq!(connection.state(), ConnectionState::AwaitingVerack);
        assert_eq!(peer.recv().await.0, "version");
        connection.disconnect().await.unwrap();
    }

    #[tokio::test]
    async fn test_disconnect_with_stalled_peer() {
        let connection = Connection::for_network(NetworkParameters::Regtest);
        let events = record_events(&connection);
        let (client, server) = tokio::io::duplex(512);
        connection.connect_with(client, peer_addr()).await.unwrap();
        let mut peer = MockPeer {
            stream: server,
            codec: MessageCodec::new(connection.network().magic()),
        };
        assert_eq!(peer.recv().await.0, "version");

        // The getdata answering this is far larger than the transport buffer,
        // and the peer never reads it
        let items: Vec<(u32, [u8; 32])> = (0..200u8).map(|i| (1, [i; 32])).collect();
        peer.send("inv", inv_payload(&items)).await;
        tokio::time::sleep(Duration::from_millis(50)).await;

        let result = tokio::time::timeout(Duration::from_secs(3), connection.disconnect()).await;
        assert!(matches!(result, Ok(Ok(()))));
        assert_eq!(connection.state(), ConnectionState::Disconnected);
        assert_eq!(disconnected_count(&events), 1);
        drop(peer);
    }

    #[tokio::test]
    async fn test_write_error_surfaces_to_caller() {
        let connection = Connection::for_network(NetworkParameters::Regtest);
        let events = record_events(&connection);
        let (client, server) = tokio::io::duplex(64 * 1024);
        let broken = Arc::new(AtomicBool::new(false));
        let transport = FailingWrites {
            inner: client,
            broken: broken.clone(),
        };
        connection.connect_with(transport, peer_addr()).await.unwrap();
        let mut peer = MockPeer {
            stream: server,
            codec: MessageCodec::new(connection.network().magic()),
        };
        peer.handshake(ServiceFlags::NODE_NETWORK).await;

        broken.store(true, Ordering::SeqCst);
        assert!(matches!(
            connection.send(&Ping { nonce: Some(1) }).await,
            Err(ConnectionError::Framing(FramingError::Io(_)))
        ));
        assert!(connection.is_connected());

        // A failed pong ends the session from the dispatch side
        peer.send("ping", 7u64.to_le_bytes().to_vec()).await;
        wait_for(|| events.lock().unwrap().contains(&ConnectionEvent::Disconnected)).await;
        assert!(!connection.is_connected());
        assert_eq!(disconnected_count(&events), 1);
        connection.disconnect().await.unwrap();
    }

    #[tokio::test]
    async fn test_peer_eof_disconnects_once() {
        let connection = Connection::for_network(NetworkParameters::Regtest);
        let events = record_events(&connection);
        let mut peer = start(&connection).await;
        peer.handshake(ServiceFlags::NODE_NETWORK).await;

        drop(peer);
        wait_for(|| events.lock().unwrap().contains(&ConnectionEvent::Disconnected)).await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(disconnected_count(&events), 1);
        assert!(!connection.is_connected());

        connection.disconnect().await.unwrap();
        assert_eq!(disconnected_count(&events), 1);
    }

    #[tokio::test]
    async fn test_connect_failure_releases_session() {
        let connection = Connection::for_network(NetworkParameters::Regtest);
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let closed = listener.local_addr().unwrap();
        drop(listener);

        assert!(matches!(
            connection.connect(closed).await,
            Err(ConnectionError::Io(_))
        ));
        assert_eq!(connection.state(), ConnectionState::Disconnected);

        let mut peer = start(&connection).await;
        assert_eq!(peer.recv().await.0, "version");
        connection.disconnect().await.unwrap();
    }

    #[tokio::test]
    async fn test_concurrent_connects_dial_once() {
        let connection = Connection::for_network(NetworkParameters::Regtest);
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let (first, second) = tokio::join!(connection.connect(addr), connection.connect(addr));
        let results = [first, second];
        assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
        assert_eq!(
            results
                .iter()
                .filter(|r| matches!(r, Err(ConnectionError::AlreadyConnected)))
                .count(),
            1
        );

        let (_socket, _) = listener.accept().await.unwrap();
        assert_eq!(connection.peer_addr(), Some(addr));
        connection.disconnect().await.unwrap();
    }

    #[test]
    fn test_filter_list_validation() {
        let connection = Connection::for_network(NetworkParameters::Testnet3);
        assert!(matches!(
            connection.set_filter_list(vec!["bogus".to_string()]),
            Err(ConnectionError::Address(_))
        ));
        assert!(connection.filter_list().is_empty());
        assert!(!connection.has_filter_addresses());

        connection
            .set_filter_list(vec![FILTER_ADDRESS.to_string()])
            .unwrap();
        assert_eq!(connection.filter_list(), vec![FILTER_ADDRESS.to_string()]);

        let mut config = connection.filter_config();
        config.false_positive_rate = 0.01;
        connection.set_filter_config(config);
        assert_eq!(connection.filter_config().false_positive_rate, 0.01);
    }

    #[tokio::test]
    async fn test_send_requires_connection() {
        let connection = Connection::for_network(NetworkParameters::Regtest);
        assert!(matches!(
            connection.send(&Pong { nonce: 1 }).await,
            Err(ConnectionError::NotConnected)
        ));
    }
}
