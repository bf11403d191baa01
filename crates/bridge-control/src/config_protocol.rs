//! Configuration sub-protocol spoken on `conf` connections
//!
//! After the bridge writes whether the client is public, the agent sends a
//! sequence of 4-byte requests:
//!
//! | flag   | payload                   | reply                               |
//! |--------|---------------------------|-------------------------------------|
//! | `stus` | md5hex(secret) (32)       | len + remarks, each ending `*#*`    |
//! | `conf` | len + Client JSON         | ok, then the new client's secret    |
//! | `host` | len + Host JSON           | ok                                  |
//! | `task` | len + Task JSON           | ok per expanded port                |
//!
//! A rejected `conf`, `host` or `task` request is answered with a fail flag,
//! the connection is closed and the owning client is evicted.

use crate::bridge::{Bridge, BridgeStream};
use crate::store::{Client, Host, StoreError, Target, Task, TaskMode};
use bridge_proto::addr::parse_ports;
use bridge_proto::flags::{CONN_DATA_SEQ, NEW_CONF, NEW_HOST, NEW_TASK, WORK_STATUS};
use bridge_proto::{BridgeConn, ConnError};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum ConfigProtocolError {
    #[error("Connection error: {0}")]
    Conn(#[from] ConnError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Client {0} may not use config connections")]
    NotPermitted(i64),

    #[error("Unknown status credential")]
    UnknownCredential,

    #[error("{ports} ports but {targets} target ports")]
    PortCountMismatch { ports: usize, targets: usize },

    #[error("No ports in {0:?}")]
    NoPorts(String),

    #[error("Host {0} is already in use")]
    HostConflict(String),

    #[error("Port {0} is not available")]
    PortUnavailable(u16),
}

/// Expand a task template into one task per public port.
///
/// Secret and p2p tasks never listen and always expand to a single task on
/// port 0. With several ports, each task gets `<remark>_<port>` and the
/// matching target port, prefixed by `target_addr` when one is set.
pub fn expand_task(template: &Task, client_id: i64) -> Result<Vec<Task>, ConfigProtocolError> {
    let mode = template.mode;
    let targets = parse_ports(&template.target.target_str);

    let ports = if mode.is_portless() {
        vec![0]
    } else {
        let ports = parse_ports(&template.ports);
        if ports.len() > 1
            && matches!(mode, TaskMode::Tcp | TaskMode::Udp)
            && ports.len() != targets.len()
        {
            return Err(ConfigProtocolError::PortCountMismatch {
                ports: ports.len(),
                targets: targets.len(),
            });
        }
        ports
    };
    if ports.is_empty() {
        return Err(ConfigProtocolError::NoPorts(template.ports.clone()));
    }

    let single = ports.len() == 1;
    let tasks = ports
        .iter()
        .enumerate()
        .map(|(i, &port)| {
            let (remark, target) = if single {
                (template.remark.clone(), template.target.clone())
            } else {
                let target_str = match targets.get(i) {
                    Some(tp) if template.target_addr.is_empty() => tp.to_string(),
                    Some(tp) => format!("{}:{}", template.target_addr, tp),
                    None => template.target.target_str.clone(),
                };
                let target = Target {
                    target_str,
                    local_proxy: template.target.local_proxy,
                    ..Default::default()
                };
                (format!("{}_{}", template.remark, port), target)
            };

            Task {
                id: 0,
                port,
                status: true,
                client_id,
                remark,
                target,
                ..template.clone()
            }
        })
        .collect();

    Ok(tasks)
}

impl Bridge {
    /// Entry point for an authenticated `conf` connection
    pub(crate) async fn serve_config<S: BridgeStream>(&self, mut conn: BridgeConn<S>, client_id: i64) {
        let Some(client) = self.store.client(client_id) else {
            warn!(client_id, "Config connection for unknown client");
            let _ = conn.shutdown().await;
            return;
        };

        let is_public = client.no_display;
        if !is_public && !client.config_conn_allow {
            warn!(client_id, "{}", ConfigProtocolError::NotPermitted(client_id));
            let _ = conn.shutdown().await;
            return;
        }

        if let Err(e) = conn.write_bool(is_public).await {
            debug!(client_id, "Failed to answer config connection: {}", e);
            return;
        }
        conn.set_alive();

        self.run_config_loop(conn, client).await;
    }

    async fn run_config_loop<S>(&self, mut conn: BridgeConn<S>, mut owner: Client)
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let mut failed = false;

        loop {
            let flag = match conn.read_flag().await {
                Ok(flag) => flag,
                Err(e) => {
                    debug!(client_id = owner.id, "Config connection ended: {}", e);
                    break;
                }
            };

            let result = match &flag {
                WORK_STATUS => {
                    if let Err(e) = self.reply_status(&mut conn).await {
                        debug!(client_id = owner.id, "Status query failed: {}", e);
                        break;
                    }
                    continue;
                }
                NEW_CONF => self.add_client(&mut conn, &mut owner).await,
                NEW_HOST => self.add_host(&mut conn, &owner).await,
                NEW_TASK => self.add_tasks(&mut conn, &owner).await,
                other => {
                    debug!(flag = %String::from_utf8_lossy(other), "Ignoring unknown config flag");
                    continue;
                }
            };

            if let Err(e) = result {
                warn!(client_id = owner.id, "Config request rejected: {}", e);
                failed = true;
                let _ = conn.write_add_fail().await;
                break;
            }
        }

        if failed {
            self.del_client(owner.id).await;
        }
        let _ = conn.shutdown().await;
    }

    async fn reply_status<S>(&self, conn: &mut BridgeConn<S>) -> Result<(), ConfigProtocolError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let key = conn.read_array::<32>().await?;
        let id = self
            .store
            .client_id_by_md5_key(&key)
            .ok_or(ConfigProtocolError::UnknownCredential)?;

        let mut remarks = String::new();
        for host in self.store.hosts_of(id) {
            remarks.push_str(&host.remark);
            remarks.push_str(CONN_DATA_SEQ);
        }
        for task in self.store.tasks_of(id) {
            if self.run_list.contains(&task.id) {
                remarks.push_str(&task.remark);
                remarks.push_str(CONN_DATA_SEQ);
            }
        }

        conn.write_len_content(remarks.as_bytes()).await?;
        Ok(())
    }

    async fn add_client<S>(
        &self,
        conn: &mut BridgeConn<S>,
        owner: &mut Client,
    ) -> Result<(), ConfigProtocolError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let client: Client = conn.read_json().await?;
        let created = self.store.new_client(client)?;

        conn.write_add_ok().await?;
        conn.write_all(created.verify_key.as_bytes()).await?;
        self.sessions.insert_placeholder(created.id);

        info!(client_id = created.id, "Client created over config connection");
        *owner = created;
        Ok(())
    }

    async fn add_host<S>(&self, conn: &mut BridgeConn<S>, owner: &Client) -> Result<(), ConfigProtocolError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let mut host: Host = conn.read_json().await?;
        host.client_id = owner.id;
        if host.location.is_empty() {
            host.location = "/".to_string();
        }

        if !self.store.client_has_host(owner.id, &host) {
            if self.store.host_conflicts(&host) {
                return Err(ConfigProtocolError::HostConflict(host.host));
            }
            let host = self.store.new_host(host)?;
            info!(client_id = owner.id, host_id = host.id, host = %host.host, "Host added");
        }

        conn.write_add_ok().await?;
        Ok(())
    }

    async fn add_tasks<S>(&self, conn: &mut BridgeConn<S>, owner: &Client) -> Result<(), ConfigProtocolError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let template: Task = conn.read_json().await?;

        for task in expand_task(&template, owner.id)? {
            if !self.store.client_has_task_port(owner.id, task.port) {
                if !self.port_probe.is_available(task.port, task.mode) {
                    return Err(ConfigProtocolError::PortUnavailable(task.port));
                }
                let task = self.store.new_task(task)?;
                info!(
                    client_id = owner.id,
                    task_id = task.id,
                    port = task.port,
                    mode = %task.mode,
                    "Task added"
                );
                if self.open_task_tx.send(task).await.is_err() {
                    warn!(client_id = owner.id, "Open-task queue closed");
                }
            }
            conn.write_add_ok().await?;
        }
        Ok(())
    }
}
