//! Client, host and task records and the store the bridge reads them from

use bridge_auth::{md5_hex, random_key, CredentialHash};
use bridge_proto::addr::{ip_of_addr, split_targets};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use thiserror::Error;
use tracing::debug;

/// Store errors
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Verify key already in use")]
    DuplicateVerifyKey,

    #[error("Web login user name {0} already in use")]
    DuplicateWebUser(String),

    #[error("Secret mode password {0} must be unique")]
    DuplicatePassword(String),

    #[error("Client {0} not found")]
    ClientNotFound(i64),

    #[error("Failed to parse store seed: {0}")]
    Seed(#[from] serde_yaml::Error),
}

/// An agent account
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct Client {
    pub id: i64,
    pub verify_key: String,
    /// Last IP the agent authenticated from
    pub addr: String,
    /// LAN address the agent reported during the handshake
    pub local_addr: String,
    pub remark: String,
    /// Whether the agent may connect at all
    pub status: bool,
    /// Public (virtual) client: hidden, cannot hold a signal connection
    pub no_display: bool,
    pub config_conn_allow: bool,
    pub web_user_name: String,
    pub web_password: String,
    pub max_tunnel_num: u32,
}

impl Default for Client {
    fn default() -> Self {
        Self {
            id: 0,
            verify_key: String::new(),
            addr: String::new(),
            local_addr: String::new(),
            remark: String::new(),
            status: true,
            no_display: false,
            config_conn_allow: true,
            web_user_name: String::new(),
            web_password: String::new(),
            max_tunnel_num: 0,
        }
    }
}

impl Client {
    pub fn new(id: i64, verify_key: impl Into<String>) -> Self {
        Self {
            id,
            verify_key: verify_key.into(),
            ..Default::default()
        }
    }
}

#[derive(Debug, Default)]
struct PoolState {
    /// `None` until the target string is first split
    live: Option<Vec<String>>,
    removed: Vec<String>,
}

/// Live and health-removed targets of one task or host.
///
/// Clones share state, so a record fetched from the store observes health
/// updates made through any other copy.
#[derive(Debug, Clone, Default)]
pub struct TargetPool {
    state: Arc<Mutex<PoolState>>,
}

impl TargetPool {
    fn lock(&self) -> std::sync::MutexGuard<'_, PoolState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Move `target` from the live list to the removed list.
    ///
    /// The live list is materialized from `target_str` first if it has never
    /// been split, or if both lists are empty.
    pub fn mark_unhealthy(&self, target_str: &str, target: &str) {
        let mut guard = self.lock();
        let state = &mut *guard;

        let needs_split = match &state.live {
            None => true,
            Some(live) => live.is_empty() && state.removed.is_empty(),
        };
        if needs_split {
            state.live = Some(split_targets(target_str));
        }

        if let Some(live) = state.live.as_mut() {
            live.retain(|t| t != target);
        }
        if !state.removed.iter().any(|t| t == target) {
            state.removed.push(target.to_string());
        }
    }

    /// Move `target` back to the live list if it was removed for health
    pub fn mark_healthy(&self, target: &str) {
        let mut guard = self.lock();
        let state = &mut *guard;

        if !state.removed.iter().any(|t| t == target) {
            return;
        }
        let live = state.live.get_or_insert_with(Vec::new);
        if live.iter().any(|t| t == target) {
            return;
        }
        live.push(target.to_string());
        state.removed.retain(|t| t != target);
    }

    /// Targets currently eligible for proxying
    pub fn live_targets(&self, target_str: &str) -> Vec<String> {
        match &self.lock().live {
            Some(live) => live.clone(),
            None => split_targets(target_str),
        }
    }

    pub fn removed_targets(&self) -> Vec<String> {
        self.lock().removed.clone()
    }
}

/// Where a task or host forwards to
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct Target {
    /// Newline-separated `host:port` list
    pub target_str: String,
    pub local_proxy: bool,
    #[serde(skip)]
    pub pool: TargetPool,
}

impl Target {
    pub fn new(target_str: impl Into<String>) -> Self {
        Self {
            target_str: target_str.into(),
            ..Default::default()
        }
    }

    pub fn live_targets(&self) -> Vec<String> {
        self.pool.live_targets(&self.target_str)
    }
}

/// Proxy mode of a task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub enum TaskMode {
    #[default]
    Tcp,
    Udp,
    HttpProxy,
    Socks5,
    MixProxy,
    Secret,
    P2p,
    File,
}

impl TaskMode {
    /// Modes that never listen on a server port
    pub fn is_portless(&self) -> bool {
        matches!(self, TaskMode::Secret | TaskMode::P2p)
    }
}

impl fmt::Display for TaskMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TaskMode::Tcp => "tcp",
            TaskMode::Udp => "udp",
            TaskMode::HttpProxy => "httpProxy",
            TaskMode::Socks5 => "socks5",
            TaskMode::MixProxy => "mixProxy",
            TaskMode::Secret => "secret",
            TaskMode::P2p => "p2p",
            TaskMode::File => "file",
        };
        f.write_str(name)
    }
}

/// A port-based tunnel
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct Task {
    pub id: i64,
    pub port: u16,
    pub server_ip: String,
    pub mode: TaskMode,
    pub status: bool,
    pub client_id: i64,
    /// Port list as sent by the agent, e.g. `8001-8003`
    pub ports: String,
    pub password: String,
    pub remark: String,
    /// Host prefixed to each expanded target port
    pub target_addr: String,
    pub local_path: String,
    pub strip_pre: String,
    pub target: Target,
}

/// A domain-based HTTP(S) route
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct Host {
    pub id: i64,
    pub host: String,
    pub header_change: String,
    pub host_change: String,
    pub location: String,
    pub remark: String,
    /// `http`, `https` or `all`
    pub scheme: String,
    pub client_id: i64,
    pub target: Target,
}

/// Records the bridge needs from the configuration store
pub trait Store: Send + Sync {
    /// Find the active client whose secret hashes to `hash`, recording
    /// `peer_addr` as its last-seen address
    fn authenticate(&self, hash: &[u8], method: CredentialHash, peer_addr: &str) -> Option<i64>;

    fn client(&self, id: i64) -> Option<Client>;

    fn set_local_addr(&self, id: i64, local_addr: &str);

    /// Public clients are hidden and may not hold a signal connection
    fn is_public(&self, id: i64) -> bool {
        self.client(id).map(|c| c.no_display).unwrap_or(false)
    }

    /// Client whose secret's MD5 hex equals `hash`
    fn client_id_by_md5_key(&self, hash: &[u8]) -> Option<i64>;

    /// Persist a new client, minting a secret when none was supplied
    fn new_client(&self, client: Client) -> Result<Client, StoreError>;

    /// Whether `client_id` already owns a host with the same host and location
    fn client_has_host(&self, client_id: i64, host: &Host) -> bool;

    /// Whether another host claims the same host, location and scheme
    fn host_conflicts(&self, host: &Host) -> bool;

    fn new_host(&self, host: Host) -> Result<Host, StoreError>;

    /// Whether `client_id` already owns a task on `port` (port 0 never matches)
    fn client_has_task_port(&self, client_id: i64, port: u16) -> bool;

    fn new_task(&self, task: Task) -> Result<Task, StoreError>;

    /// Task whose password's MD5 hex equals `hash`
    fn task_by_md5_password(&self, hash: &[u8]) -> Option<Task>;

    fn hosts_of(&self, client_id: i64) -> Vec<Host>;

    fn tasks_of(&self, client_id: i64) -> Vec<Task>;
}

/// Clients, hosts and tasks to preload into a [`MemoryStore`]
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct StoreSeed {
    pub clients: Vec<Client>,
    pub hosts: Vec<Host>,
    pub tasks: Vec<Task>,
}

impl StoreSeed {
    pub fn from_yaml(yaml: &str) -> Result<Self, StoreError> {
        Ok(serde_yaml::from_str(yaml)?)
    }
}

/// In-memory [`Store`]
#[derive(Debug)]
pub struct MemoryStore {
    clients: DashMap<i64, Client>,
    hosts: DashMap<i64, Host>,
    tasks: DashMap<i64, Task>,
    next_client_id: AtomicI64,
    next_host_id: AtomicI64,
    next_task_id: AtomicI64,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            clients: DashMap::new(),
            hosts: DashMap::new(),
            tasks: DashMap::new(),
            next_client_id: AtomicI64::new(1),
            next_host_id: AtomicI64::new(1),
            next_task_id: AtomicI64::new(1),
        }
    }

    pub fn from_seed(seed: StoreSeed) -> Self {
        let store = Self::new();
        for client in seed.clients {
            store.insert_client(client);
        }
        for host in seed.hosts {
            store.insert_host(host);
        }
        for task in seed.tasks {
            store.insert_task(task);
        }
        debug!(
            clients = store.clients.len(),
            hosts = store.hosts.len(),
            tasks = store.tasks.len(),
            "Store seeded"
        );
        store
    }

    fn bump(counter: &AtomicI64, seen: i64) {
        counter.fetch_max(seen + 1, Ordering::SeqCst);
    }

    /// Insert a client as-is, keeping its id
    pub fn insert_client(&self, client: Client) {
        Self::bump(&self.next_client_id, client.id);
        self.clients.insert(client.id, client);
    }

    pub fn insert_host(&self, host: Host) {
        Self::bump(&self.next_host_id, host.id);
        self.hosts.insert(host.id, host);
    }

    pub fn insert_task(&self, task: Task) {
        Self::bump(&self.next_task_id, task.id);
        self.tasks.insert(task.id, task);
    }

    pub fn task(&self, id: i64) -> Option<Task> {
        self.tasks.get(&id).map(|t| t.clone())
    }

    pub fn host_count(&self) -> usize {
        self.hosts.len()
    }

    pub fn task_count(&self) -> usize {
        self.tasks.len()
    }

    fn verify_key_taken(&self, key: &str, id: i64) -> bool {
        self.clients
            .iter()
            .any(|c| c.verify_key == key && c.id != id)
    }
}

impl Store for MemoryStore {
    fn authenticate(&self, hash: &[u8], method: CredentialHash, peer_addr: &str) -> Option<i64> {
        for mut client in self.clients.iter_mut() {
            if client.status && client.id > 0 && method.digest(&client.verify_key) == hash {
                client.addr = ip_of_addr(peer_addr).to_string();
                return Some(client.id);
            }
        }
        None
    }

    fn client(&self, id: i64) -> Option<Client> {
        self.clients.get(&id).map(|c| c.clone())
    }

    fn set_local_addr(&self, id: i64, local_addr: &str) {
        if let Some(mut client) = self.clients.get_mut(&id) {
            client.local_addr = local_addr.to_string();
        }
    }

    fn client_id_by_md5_key(&self, hash: &[u8]) -> Option<i64> {
        self.clients
            .iter()
            .find(|c| md5_hex(&c.verify_key).as_bytes() == hash)
            .map(|c| c.id)
    }

    fn new_client(&self, mut client: Client) -> Result<Client, StoreError> {
        if !client.web_user_name.is_empty()
            && self
                .clients
                .iter()
                .any(|c| c.web_user_name == client.web_user_name && c.id != client.id)
        {
            return Err(StoreError::DuplicateWebUser(client.web_user_name));
        }

        if client.id == 0 {
            client.id = self.next_client_id.fetch_add(1, Ordering::SeqCst);
        }

        if client.verify_key.is_empty() {
            loop {
                let key = random_key(16);
                if !self.verify_key_taken(&key, client.id) {
                    client.verify_key = key;
                    break;
                }
            }
        } else if self.verify_key_taken(&client.verify_key, client.id) {
            return Err(StoreError::DuplicateVerifyKey);
        }

        self.insert_client(client.clone());
        Ok(client)
    }

    fn client_has_host(&self, client_id: i64, host: &Host) -> bool {
        self.hosts.iter().any(|h| {
            h.client_id == client_id && h.host == host.host && h.location == host.location
        })
    }

    fn host_conflicts(&self, host: &Host) -> bool {
        self.hosts.iter().any(|h| {
            h.id != host.id
                && h.host == host.host
                && h.location == host.location
                && (h.scheme == "all" || h.scheme == host.scheme)
        })
    }

    fn new_host(&self, mut host: Host) -> Result<Host, StoreError> {
        host.id = self.next_host_id.fetch_add(1, Ordering::SeqCst);
        self.hosts.insert(host.id, host.clone());
        Ok(host)
    }

    fn client_has_task_port(&self, client_id: i64, port: u16) -> bool {
        port != 0
            && self
                .tasks
                .iter()
                .any(|t| t.client_id == client_id && t.port == port)
    }

    fn new_task(&self, mut task: Task) -> Result<Task, StoreError> {
        if task.mode.is_portless()
            && self
                .tasks
                .iter()
                .any(|t| t.mode.is_portless() && t.password == task.password)
        {
            return Err(StoreError::DuplicatePassword(task.password));
        }

        task.id = self.next_task_id.fetch_add(1, Ordering::SeqCst);
        self.tasks.insert(task.id, task.clone());
        Ok(task)
    }

    fn task_by_md5_password(&self, hash: &[u8]) -> Option<Task> {
        self.tasks
            .iter()
            .find(|t| md5_hex(&t.password).as_bytes() == hash)
            .map(|t| t.clone())
    }

    fn hosts_of(&self, client_id: i64) -> Vec<Host> {
        self.hosts
            .iter()
            .filter(|h| h.client_id == client_id)
            .map(|h| h.clone())
            .collect()
    }

    fn tasks_of(&self, client_id: i64) -> Vec<Task> {
        self.tasks
            .iter()
            .filter(|t| t.client_id == client_id)
            .map(|t| t.clone())
            .collect()
    }
}
