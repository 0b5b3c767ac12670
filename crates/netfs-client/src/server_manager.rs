//! Server discovery and the per-server add/update/remove state machine.

use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::{Arc, OnceLock, Weak};
use std::time::Duration;

use async_trait::async_trait;
use netfs_net::{Channel, NetError, RequestChannel, TcpChannel};
use netfs_proto::{BroadcastMessage, BroadcastType, Request, ServerInfo, ServerInfoRequest, ShareInfo};
use netfs_types::{NetAddress, RPCCode, Result, Status, StatusCode};
use parking_lot::Mutex;
use tokio::net::UdpSocket;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::config::{ClientConfig, RetryConfig};
use crate::retry::ExponentialBackoff;
use crate::task::{Task, TaskManager};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerState {
    /// First descriptor fetch in flight.
    Adding,
    Ready,
    /// Re-fetch in flight; the old descriptor stays in use.
    Updating,
    /// Removal requested while a fetch was in flight.
    Removing,
    /// Replaced or removed.
    Obsolete,
}

/// A server as the manager tracks it.
pub struct ExtendedServerInfo {
    address: NetAddress,
    details: OnceLock<ServerInfo>,
    state: Mutex<ServerState>,
}

impl ExtendedServerInfo {
    fn new(address: NetAddress, state: ServerState) -> Self {
        Self {
            address,
            details: OnceLock::new(),
            state: Mutex::new(state),
        }
    }

    /// A ready descriptor built from known details.
    pub fn with_details(address: NetAddress, details: ServerInfo) -> Self {
        let info = Self::new(address, ServerState::Ready);
        let _ = info.details.set(details);
        info
    }

    /// Address of the server's main connection.
    pub fn address(&self) -> NetAddress {
        self.address
    }

    pub fn state(&self) -> ServerState {
        *self.state.lock()
    }

    fn set_state(&self, state: ServerState) {
        *self.state.lock() = state;
    }

    pub fn server_name(&self) -> &str {
        self.details.get().map_or("", |d| d.server_name.as_str())
    }

    pub fn connection_method(&self) -> &str {
        self.details.get().map_or("", |d| d.connection_method.as_str())
    }

    pub fn shares(&self) -> &[ShareInfo] {
        self.details.get().map_or(&[], |d| d.shares.as_slice())
    }

    pub fn share(&self, name: &str) -> Option<&ShareInfo> {
        self.details.get()?.share(name)
    }

    /// The server name, or its address when the server did not name itself.
    pub fn display_name(&self) -> String {
        match self.server_name() {
            "" => self.address.ipv4().to_string(),
            name => name.to_owned(),
        }
    }
}

impl std::fmt::Debug for ExtendedServerInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExtendedServerInfo")
            .field("address", &self.address)
            .field("name", &self.server_name())
            .field("state", &self.state())
            .field("shares", &self.shares().len())
            .finish()
    }
}

/// Receives server lifecycle notifications, always outside the manager lock.
pub trait ServerManagerListener: Send + Sync + 'static {
    fn server_added(&self, info: Arc<ExtendedServerInfo>);
    fn server_updated(&self, old: Arc<ExtendedServerInfo>, new: Arc<ExtendedServerInfo>);
    fn server_removed(&self, info: Arc<ExtendedServerInfo>);
}

/// Where full server descriptors come from.
#[async_trait]
pub trait ServerInfoSource: Send + Sync + 'static {
    async fn fetch_server_info(&self, address: NetAddress) -> Result<ServerInfo>;
}

/// Reads the one `ServerInfo` a server sends on its info port.
pub struct TcpServerInfoSource {
    port: u16,
    retry: RetryConfig,
}

impl TcpServerInfoSource {
    pub fn new(port: u16, retry: RetryConfig) -> Self {
        Self { port, retry }
    }

    async fn connect(&self, target: NetAddress) -> Result<TcpChannel> {
        let mut backoff = ExponentialBackoff::from_config(&self.retry);
        loop {
            match TcpChannel::connect(target).await {
                Ok(channel) => return Ok(channel),
                Err(err @ NetError::ConnectFailed { .. }) => match backoff.next_wait() {
                    Some(wait) => {
                        tracing::debug!(%target, %err, attempt = backoff.attempts(), "server info port unreachable, retrying");
                        tokio::time::sleep(wait).await;
                    }
                    None => return Err(err.into()),
                },
                Err(err) => return Err(err.into()),
            }
        }
    }
}

#[async_trait]
impl ServerInfoSource for TcpServerInfoSource {
    async fn fetch_server_info(&self, address: NetAddress) -> Result<ServerInfo> {
        let target = address.with_port(self.port);
        let channel = self.connect(target).await?;
        let received = tokio::time::timeout(
            self.retry.server_info_timeout,
            RequestChannel::new(&channel).receive_message::<Request>(),
        )
        .await;
        channel.close().await;
        let request = match received {
            Ok(request) => request?,
            Err(_) => return Err(Status::with_message(RPCCode::TIMEOUT, format!("no server info from {target}"))),
        };
        Ok(ServerInfoRequest::try_from(request)?.server_info)
    }
}

enum Notice {
    Added(Arc<ExtendedServerInfo>),
    Updated(Arc<ExtendedServerInfo>, Arc<ExtendedServerInfo>),
    Removed(Arc<ExtendedServerInfo>),
}

/// Tracks the servers on the network.
///
/// Servers are keyed by IPv4 address. A server has at most one descriptor
/// fetch in flight; broadcasts arriving meanwhile are ignored.
pub struct ServerManager {
    this: Weak<ServerManager>,
    config: ClientConfig,
    listener: Weak<dyn ServerManagerListener>,
    source: Arc<dyn ServerInfoSource>,
    servers: Mutex<HashMap<u32, Arc<ExtendedServerInfo>>>,
    tasks: TaskManager,
    discovery: Mutex<Option<JoinHandle<()>>>,
    shutdown: watch::Sender<bool>,
}

impl ServerManager {
    pub fn new(
        config: ClientConfig,
        listener: Weak<dyn ServerManagerListener>,
        source: Arc<dyn ServerInfoSource>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            this: this.clone(),
            config,
            listener,
            source,
            servers: Mutex::new(HashMap::new()),
            tasks: TaskManager::new(),
            discovery: Mutex::new(None),
            shutdown: watch::channel(false).0,
        })
    }

    /// Bind the broadcast socket, say hello and start listening.
    pub async fn start(&self) -> Result<()> {
        let discovery = &self.config.discovery;
        if !discovery.enabled {
            tracing::info!("server discovery disabled");
            return Ok(());
        }
        let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, discovery.broadcast_port))
            .await
            .map_err(|e| io_status("bind discovery socket", e))?;
        socket.set_broadcast(true).map_err(|e| io_status("enable broadcast", e))?;

        if discovery.hello_on_start {
            let hello = BroadcastMessage::new(BroadcastType::ClientHello).encode();
            if let Err(err) = socket.send_to(&hello, (Ipv4Addr::BROADCAST, discovery.broadcast_port)).await {
                tracing::warn!(%err, "failed to send client hello");
            }
        }

        tracing::info!(port = discovery.broadcast_port, "listening for server broadcasts");
        let task = tokio::spawn(discovery_loop(self.this.clone(), socket, self.shutdown.subscribe()));
        *self.discovery.lock() = Some(task);
        Ok(())
    }

    /// Stop discovery and interrupt pending fetches.
    pub async fn shutdown(&self) {
        self.shutdown.send_replace(true);
        let task = self.discovery.lock().take();
        if let Some(task) = task {
            let _ = task.await;
        }
        self.tasks.shutdown().await;
    }

    pub fn handle_datagram(&self, from: SocketAddr, data: &[u8]) {
        let message = match BroadcastMessage::decode(data) {
            Ok(message) => message,
            Err(err) => {
                tracing::debug!(%from, %err, "discarding datagram");
                return;
            }
        };
        let Some(sender) = NetAddress::from_socket_addr(from) else {
            return;
        };
        let address = sender.with_port(self.config.discovery.connection_port);
        match message.message_type {
            BroadcastType::Tick => self.server_seen(address, false),
            BroadcastType::Update => self.server_seen(address, true),
            BroadcastType::ClientHello => {}
        }
    }

    /// Make a server known as if it had sent a tick.
    pub fn add_server(&self, address: NetAddress) {
        self.server_seen(address, false);
    }

    fn server_seen(&self, address: NetAddress, update: bool) {
        let task = {
            let mut servers = self.servers.lock();
            match servers.get(&address.ip) {
                None => {
                    let info = Arc::new(ExtendedServerInfo::new(address, ServerState::Adding));
                    servers.insert(address.ip, info.clone());
                    tracing::info!(%address, "new server");
                    Some(FetchTask {
                        manager: self.this.clone(),
                        old: None,
                        info,
                    })
                }
                Some(existing) if update && existing.state() == ServerState::Ready => {
                    existing.set_state(ServerState::Updating);
                    tracing::info!(%address, "server updated, refetching");
                    Some(FetchTask {
                        manager: self.this.clone(),
                        old: Some(existing.clone()),
                        info: Arc::new(ExtendedServerInfo::new(existing.address, ServerState::Updating)),
                    })
                }
                Some(_) => None,
            }
        };
        if let Some(task) = task {
            if let Err(err) = self.tasks.run_task(Arc::new(task)) {
                tracing::debug!(%address, %err, "fetch not started");
            }
        }
    }

    /// Ready servers are removed at once; one with a fetch in flight is
    /// flagged and removed when the fetch completes.
    pub fn remove_server(&self, address: NetAddress) {
        let removed = {
            let mut servers = self.servers.lock();
            match servers.get(&address.ip).map(|info| info.state()) {
                Some(ServerState::Ready) => servers.remove(&address.ip),
                Some(ServerState::Adding | ServerState::Updating) => {
                    if let Some(info) = servers.get(&address.ip) {
                        info.set_state(ServerState::Removing);
                    }
                    None
                }
                _ => None,
            }
        };
        if let Some(info) = removed {
            info.set_state(ServerState::Obsolete);
            tracing::info!(address = %info.address, "server removed");
            self.notify(Notice::Removed(info));
        }
    }

    fn fetch_done(&self, old: Option<Arc<ExtendedServerInfo>>, info: Arc<ExtendedServerInfo>, result: Result<ServerInfo>) {
        let ip = info.address.ip;
        let notice = {
            let mut servers = self.servers.lock();
            let tracked = old.as_ref().unwrap_or(&info).clone();
            let still_tracked = servers.get(&ip).is_some_and(|s| Arc::ptr_eq(s, &tracked));

            if tracked.state() == ServerState::Removing {
                if still_tracked {
                    servers.remove(&ip);
                }
                tracked.set_state(ServerState::Obsolete);
                info.set_state(ServerState::Obsolete);
                Some(Notice::Removed(tracked))
            } else {
                match (old, result) {
                    (None, Ok(details)) => {
                        let _ = info.details.set(details);
                        info.set_state(ServerState::Ready);
                        Some(Notice::Added(info))
                    }
                    (None, Err(err)) => {
                        tracing::warn!(address = %info.address, %err, "failed to fetch server info, dropping server");
                        if still_tracked {
                            servers.remove(&ip);
                        }
                        info.set_state(ServerState::Obsolete);
                        None
                    }
                    (Some(old), Ok(details)) => {
                        let _ = info.details.set(details);
                        info.set_state(ServerState::Ready);
                        old.set_state(ServerState::Obsolete);
                        servers.insert(ip, info.clone());
                        Some(Notice::Updated(old, info))
                    }
                    (Some(old), Err(err)) => {
                        tracing::warn!(address = %old.address, %err, "failed to refetch server info, keeping old");
                        old.set_state(ServerState::Ready);
                        None
                    }
                }
            }
        };
        if let Some(notice) = notice {
            self.notify(notice);
        }
    }

    fn fetch_abandoned(&self, old: Option<&Arc<ExtendedServerInfo>>, info: &Arc<ExtendedServerInfo>) {
        let mut servers = self.servers.lock();
        match old {
            Some(old) if old.state() == ServerState::Updating => old.set_state(ServerState::Ready),
            Some(_) => {}
            None => {
                if servers.get(&info.address.ip).is_some_and(|s| Arc::ptr_eq(s, info)) {
                    servers.remove(&info.address.ip);
                }
            }
        }
    }

    fn notify(&self, notice: Notice) {
        let Some(listener) = self.listener.upgrade() else {
            return;
        };
        match notice {
            Notice::Added(info) => listener.server_added(info),
            Notice::Updated(old, new) => listener.server_updated(old, new),
            Notice::Removed(info) => listener.server_removed(info),
        }
    }

    pub fn server_info(&self, address: NetAddress) -> Option<Arc<ExtendedServerInfo>> {
        self.servers.lock().get(&address.ip).cloned()
    }

    pub fn servers(&self) -> Vec<Arc<ExtendedServerInfo>> {
        self.servers.lock().values().cloned().collect()
    }
}

fn io_status(what: &str, err: std::io::Error) -> Status {
    Status::with_message(StatusCode::IO_ERROR, format!("{what}: {err}"))
}

async fn discovery_loop(manager: Weak<ServerManager>, socket: UdpSocket, mut shutdown: watch::Receiver<bool>) {
    let mut buffer = [0u8; 256];
    loop {
        tokio::select! {
            _ = async { let _ = shutdown.wait_for(|stop| *stop).await; } => break,
            received = socket.recv_from(&mut buffer) => match received {
                Ok((len, from)) => {
                    let Some(manager) = manager.upgrade() else {
                        break;
                    };
                    manager.handle_datagram(from, &buffer[..len]);
                }
                Err(err) => {
                    tracing::warn!(%err, "discovery socket error");
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            },
        }
    }
    tracing::debug!("discovery stopped");
}

struct FetchTask {
    manager: Weak<ServerManager>,
    old: Option<Arc<ExtendedServerInfo>>,
    info: Arc<ExtendedServerInfo>,
}

#[async_trait]
impl Task for FetchTask {
    fn name(&self) -> String {
        format!("fetch server info {}", self.info.address)
    }

    async fn execute(&self) -> Result<()> {
        let Some(manager) = self.manager.upgrade() else {
            return Ok(());
        };
        let source = manager.source.clone();
        drop(manager);
        let result = source.fetch_server_info(self.info.address).await;
        if let Some(manager) = self.manager.upgrade() {
            manager.fetch_done(self.old.clone(), self.info.clone(), result);
        }
        Ok(())
    }

    fn cleanup(&self, error: Status) {
        tracing::debug!(address = %self.info.address, %error, "server info fetch abandoned");
        if let Some(manager) = self.manager.upgrade() {
            manager.fetch_abandoned(self.old.as_ref(), &self.info);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    use netfs_types::ServerCode;
    use tokio::sync::Semaphore;

    use super::*;

    #[derive(Default)]
    struct Recorder {
        events: Mutex<Vec<(&'static str, String, ServerState)>>,
    }

    impl Recorder {
        fn events(&self) -> Vec<(&'static str, String, ServerState)> {
            self.events.lock().clone()
        }
    }

    impl ServerManagerListener for Recorder {
        fn server_added(&self, info: Arc<ExtendedServerInfo>) {
            self.events.lock().push(("added", info.server_name().to_owned(), info.state()));
        }

        fn server_updated(&self, _old: Arc<ExtendedServerInfo>, new: Arc<ExtendedServerInfo>) {
            self.events.lock().push(("updated", new.server_name().to_owned(), new.state()));
        }

        fn server_removed(&self, info: Arc<ExtendedServerInfo>) {
            self.events.lock().push(("removed", info.server_name().to_owned(), info.state()));
        }
    }

    /// Answers after a permit is released, so tests can hold a fetch in flight.
    struct GatedSource {
        gate: Semaphore,
        fail: AtomicBool,
        fetches: AtomicUsize,
    }

    impl GatedSource {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                gate: Semaphore::new(0),
                fail: AtomicBool::new(false),
                fetches: AtomicUsize::new(0),
            })
        }

        fn release(&self) {
            self.gate.add_permits(1);
        }
    }

    #[async_trait]
    impl ServerInfoSource for GatedSource {
        async fn fetch_server_info(&self, _address: NetAddress) -> Result<ServerInfo> {
            let n = self.fetches.fetch_add(1, Ordering::SeqCst);
            self.gate
                .acquire()
                .await
                .map_err(|_| Status::new(RPCCode::SHUTTING_DOWN))?
                .forget();
            if self.fail.load(Ordering::SeqCst) {
                return Err(Status::new(ServerCode::BAD_SERVER_INFO));
            }
            Ok(ServerInfo {
                server_name: format!("srv{n}"),
                connection_method: "insecure".into(),
                shares: vec![ShareInfo {
                    share_name: "docs".into(),
                }],
            })
        }
    }

    fn setup() -> (Arc<ServerManager>, Arc<Recorder>, Arc<GatedSource>) {
        let recorder = Arc::new(Recorder::default());
        let source = GatedSource::new();
        let weak: Weak<dyn ServerManagerListener> = Arc::downgrade(&recorder) as Weak<Recorder>;
        let manager = ServerManager::new(ClientConfig::default(), weak, source.clone());
        (manager, recorder, source)
    }

    fn datagram(kind: BroadcastType) -> [u8; 12] {
        BroadcastMessage::new(kind).encode()
    }

    fn sender() -> SocketAddr {
        "10.0.0.7:40000".parse().unwrap()
    }

    fn server_address() -> NetAddress {
        NetAddress::from_octets(10, 0, 0, 7, netfs_proto::DEFAULT_CONNECTION_PORT)
    }

    async fn settle(recorder: &Recorder, count: usize) {
        for _ in 0..200 {
            if recorder.events().len() >= count {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    #[tokio::test]
    async fn test_tick_adds_server_once() {
        let (manager, recorder, source) = setup();
        manager.handle_datagram(sender(), &datagram(BroadcastType::Tick));
        assert_eq!(manager.server_info(server_address()).unwrap().state(), ServerState::Adding);
        manager.handle_datagram(sender(), &datagram(BroadcastType::Tick));
        source.release();
        settle(&recorder, 1).await;

        assert_eq!(recorder.events(), vec![("added", "srv0".to_owned(), ServerState::Ready)]);
        assert_eq!(source.fetches.load(Ordering::SeqCst), 1);
        let info = manager.server_info(server_address()).unwrap();
        assert_eq!(info.address(), server_address());
        assert_eq!(info.shares().len(), 1);

        manager.handle_datagram(sender(), &datagram(BroadcastType::Tick));
        manager.handle_datagram(sender(), &datagram(BroadcastType::ClientHello));
        settle(&recorder, 2).await;
        assert_eq!(recorder.events().len(), 1);
        assert_eq!(source.fetches.load(Ordering::SeqCst), 1);
        manager.shutdown().await;
    }

    #[tokio::test]
    async fn test_bad_datagrams_ignored() {
        let (manager, _recorder, source) = setup();
        let mut bad = datagram(BroadcastType::Tick);
        bad[0] = b'X';
        manager.handle_datagram(sender(), &bad);
        manager.handle_datagram(sender(), &bad[..8]);
        assert!(manager.servers().is_empty());
        assert_eq!(source.fetches.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_remove_while_adding_reports_only_removal() {
        for fail in [false, true] {
            let (manager, recorder, source) = setup();
            source.fail.store(fail, Ordering::SeqCst);
            manager.add_server(server_address());
            manager.remove_server(server_address());
            assert_eq!(manager.server_info(server_address()).unwrap().state(), ServerState::Removing);
            source.release();
            settle(&recorder, 1).await;

            let events = recorder.events();
            assert_eq!(events.len(), 1, "fail={fail}: {events:?}");
            assert_eq!(events[0].0, "removed");
            assert_eq!(events[0].2, ServerState::Obsolete);
            assert!(manager.servers().is_empty());
            manager.shutdown().await;
        }
    }

    #[tokio::test]
    async fn test_update_replaces_descriptor() {
        let (manager, recorder, source) = setup();
        manager.add_server(server_address());
        source.release();
        settle(&recorder, 1).await;
        let old = manager.server_info(server_address()).unwrap();

        manager.handle_datagram(sender(), &datagram(BroadcastType::Update));
        assert_eq!(old.state(), ServerState::Updating);
        // Single fetch in flight: more updates are ignored.
        manager.handle_datagram(sender(), &datagram(BroadcastType::Update));
        manager.handle_datagram(sender(), &datagram(BroadcastType::Update));
        source.release();
        settle(&recorder, 2).await;

        assert_eq!(source.fetches.load(Ordering::SeqCst), 2);
        assert_eq!(recorder.events()[1], ("updated", "srv1".to_owned(), ServerState::Ready));
        assert_eq!(old.state(), ServerState::Obsolete);
        let current = manager.server_info(server_address()).unwrap();
        assert_eq!(current.server_name(), "srv1");
        manager.shutdown().await;
    }

    #[tokio::test]
    async fn test_failed_update_keeps_old() {
        let (manager, recorder, source) = setup();
        manager.add_server(server_address());
        source.release();
        settle(&recorder, 1).await;

        source.fail.store(true, Ordering::SeqCst);
        manager.handle_datagram(sender(), &datagram(BroadcastType::Update));
        source.release();
        for _ in 0..100 {
            if manager.server_info(server_address()).unwrap().state() == ServerState::Ready {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        let info = manager.server_info(server_address()).unwrap();
        assert_eq!(info.state(), ServerState::Ready);
        assert_eq!(info.server_name(), "srv0");
        assert_eq!(recorder.events().len(), 1);
        manager.shutdown().await;
    }

    #[tokio::test]
    async fn test_remove_ready_server() {
        let (manager, recorder, source) = setup();
        manager.add_server(server_address());
        source.release();
        settle(&recorder, 1).await;
        manager.remove_server(server_address());
        assert_eq!(recorder.events()[1].0, "removed");
        assert!(manager.server_info(server_address()).is_none());
        manager.remove_server(server_address());
        assert_eq!(recorder.events().len(), 2);
        manager.shutdown().await;
    }

    #[tokio::test]
    async fn test_shutdown_abandons_pending_fetch() {
        let (manager, recorder, _source) = setup();
        manager.add_server(server_address());
        manager.shutdown().await;
        assert!(manager.servers().is_empty());
        assert!(recorder.events().is_empty());
    }
}
