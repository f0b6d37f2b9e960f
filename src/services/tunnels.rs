use crate::constants::network;
use crate::errors::ToolError;
use crate::services::events::{BrokerEvent, EventBus};
use crate::services::logger::Logger;
use crate::services::registry::ConnectionRegistry;
use chrono::Utc;
use dashmap::DashMap;
use serde::Serialize;
use serde_json::Value;
use ssh2::Session;
use std::io::{Read, Write};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TunnelRecord {
    pub id: String,
    pub connection_id: String,
    pub local_port: u16,
    pub remote_host: String,
    pub remote_port: u16,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub active: bool,
    pub created_at: String,
}

struct TunnelRuntime {
    listener_task: JoinHandle<()>,
    shutdown: Arc<AtomicBool>,
    pairs: Arc<DashMap<u64, Arc<AtomicBool>>>,
}

struct TunnelEntry {
    record: TunnelRecord,
    runtime: Option<TunnelRuntime>,
}

/// Local TCP listeners bridged through SSH `direct-tcpip` channels. Each
/// tunnel runs on its own SSH session; each accepted socket gets a blocking
/// bridge loop, and a dying pair never takes the listener with it.
pub struct TunnelManager {
    logger: Logger,
    registry: Arc<ConnectionRegistry>,
    events: EventBus,
    tunnels: Arc<DashMap<String, TunnelEntry>>,
    pair_seq: AtomicU64,
}

impl TunnelManager {
    pub fn new(logger: Logger, registry: Arc<ConnectionRegistry>, events: EventBus) -> Self {
        Self {
            logger: logger.child("tunnels"),
            registry,
            events,
            tunnels: Arc::new(DashMap::new()),
            pair_seq: AtomicU64::new(1),
        }
    }

    fn ensure_port_free(&self, local_port: u16) -> Result<(), ToolError> {
        let taken = self
            .tunnels
            .iter()
            .any(|entry| entry.value().record.active && entry.value().record.local_port == local_port);
        if taken {
            return Err(ToolError::tunnel_port_in_use(format!(
                "Local port {} is already bound by an active tunnel",
                local_port
            )));
        }
        Ok(())
    }

    pub async fn create(
        &self,
        connection_id: &str,
        local_port: u16,
        remote_host: &str,
        remote_port: u16,
        description: Option<String>,
    ) -> Result<TunnelRecord, ToolError> {
        self.ensure_port_free(local_port)?;

        let session = self.registry.open_dedicated_session(connection_id).await?;
        session.set_blocking(false);
        let session = Arc::new(session);

        let listener = tokio::net::TcpListener::bind(("127.0.0.1", local_port))
            .await
            .map_err(|err| {
                ToolError::tunnel_port_in_use(format!(
                    "Cannot bind 127.0.0.1:{}: {}",
                    local_port, err
                ))
            })?;

        let record = TunnelRecord {
            id: uuid::Uuid::new_v4().to_string(),
            connection_id: connection_id.to_string(),
            local_port,
            remote_host: remote_host.to_string(),
            remote_port,
            description,
            active: true,
            created_at: Utc::now().to_rfc3339(),
        };

        let shutdown = Arc::new(AtomicBool::new(false));
        let pairs: Arc<DashMap<u64, Arc<AtomicBool>>> = Arc::new(DashMap::new());

        let accept_logger = self.logger.clone();
        let accept_session = session.clone();
        let accept_pairs = pairs.clone();
        let accept_shutdown = shutdown.clone();
        let remote_host_owned = remote_host.to_string();
        let tunnel_id = record.id.clone();
        let pair_seq = Arc::new(AtomicU64::new(self.pair_seq.fetch_add(1, Ordering::Relaxed) << 32));
        let listener_task = tokio::spawn(async move {
            loop {
                let (stream, peer) = match listener.accept().await {
                    Ok(accepted) => accepted,
                    Err(err) => {
                        accept_logger.warn(
                            "tunnel accept failed",
                            Some(&serde_json::json!({"tunnel_id": tunnel_id, "error": err.to_string()})),
                        );
                        continue;
                    }
                };
                if accept_shutdown.load(Ordering::Relaxed) {
                    break;
                }
                let std_stream = match stream.into_std() {
                    Ok(s) => s,
                    Err(_) => continue,
                };
                let pair_id = pair_seq.fetch_add(1, Ordering::Relaxed);
                let pair_flag = Arc::new(AtomicBool::new(false));
                accept_pairs.insert(pair_id, pair_flag.clone());

                let bridge_session = accept_session.clone();
                let bridge_pairs = accept_pairs.clone();
                let bridge_logger = accept_logger.clone();
                let host = remote_host_owned.clone();
                let id_for_log = tunnel_id.clone();
                tokio::task::spawn_blocking(move || {
                    if let Err(err) =
                        bridge_pair(&bridge_session, std_stream, &host, remote_port, &pair_flag)
                    {
                        bridge_logger.debug(
                            "tunnel pair closed",
                            Some(&serde_json::json!({
                                "tunnel_id": id_for_log,
                                "peer": peer.to_string(),
                                "reason": err.message,
                            })),
                        );
                    }
                    bridge_pairs.remove(&pair_id);
                });
            }
        });

        self.tunnels.insert(
            record.id.clone(),
            TunnelEntry {
                record: record.clone(),
                runtime: Some(TunnelRuntime {
                    listener_task,
                    shutdown,
                    pairs,
                }),
            },
        );
        self.logger.info(
            "tunnel created",
            Some(&serde_json::json!({
                "tunnel_id": record.id,
                "local_port": local_port,
                "remote": format!("{}:{}", remote_host, remote_port),
            })),
        );
        Ok(record)
    }

    /// Stop the listener and destroy every socket pair. Closing an unknown
    /// tunnel is a no-op.
    pub fn close(&self, tunnel_id: &str) -> bool {
        let Some((_, entry)) = self.tunnels.remove(tunnel_id) else {
            return false;
        };
        if let Some(runtime) = entry.runtime {
            runtime.shutdown.store(true, Ordering::Relaxed);
            runtime.listener_task.abort();
            for pair in runtime.pairs.iter() {
                pair.value().store(true, Ordering::Relaxed);
            }
        }
        self.events.emit(BrokerEvent::TunnelClosed {
            tunnel_id: tunnel_id.to_string(),
        });
        self.logger
            .info("tunnel closed", Some(&serde_json::json!({"tunnel_id": tunnel_id})));
        true
    }

    pub fn close_for_connection(&self, connection_id: &str) -> usize {
        let ids: Vec<String> = self
            .tunnels
            .iter()
            .filter(|entry| entry.value().record.connection_id == connection_id)
            .map(|entry| entry.key().clone())
            .collect();
        let mut closed = 0;
        for id in ids {
            if self.close(&id) {
                closed += 1;
            }
        }
        closed
    }

    pub fn get(&self, tunnel_id: &str) -> Option<TunnelRecord> {
        self.tunnels.get(tunnel_id).map(|e| e.value().record.clone())
    }

    pub fn list(&self) -> Vec<Value> {
        let mut tunnels: Vec<Value> = self
            .tunnels
            .iter()
            .map(|entry| {
                let record = &entry.value().record;
                let live_pairs = entry
                    .value()
                    .runtime
                    .as_ref()
                    .map(|r| r.pairs.len())
                    .unwrap_or(0);
                let mut value = serde_json::to_value(record).unwrap_or(Value::Null);
                if let Value::Object(map) = &mut value {
                    map.insert("livePairs".to_string(), Value::Number(live_pairs.into()));
                }
                value
            })
            .collect();
        tunnels.sort_by_key(|t| {
            t.get("localPort").and_then(|v| v.as_u64()).unwrap_or(0)
        });
        tunnels
    }

    pub fn len(&self) -> usize {
        self.tunnels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tunnels.is_empty()
    }
}

/// Pump bytes both ways between a local socket and a `direct-tcpip` channel
/// until either side closes or the tunnel shuts down.
fn bridge_pair(
    session: &Session,
    tcp: std::net::TcpStream,
    remote_host: &str,
    remote_port: u16,
    shutdown: &AtomicBool,
) -> Result<(), ToolError> {
    let mut channel = open_direct_tcpip(session, remote_host, remote_port)?;
    tcp.set_nodelay(true).ok();
    tcp.set_nonblocking(true)
        .map_err(|err| ToolError::tunnel_forward_failed(err.to_string()))?;
    let mut tcp = tcp;

    let mut buf = [0u8; 16 * 1024];
    let mut tcp_open = true;
    loop {
        if shutdown.load(Ordering::Relaxed) {
            break;
        }
        let mut progressed = false;

        if tcp_open {
            match tcp.read(&mut buf) {
                Ok(0) => {
                    tcp_open = false;
                    let _ = channel.send_eof();
                }
                Ok(n) => {
                    write_all_retry(&mut channel, &buf[..n], shutdown)?;
                    progressed = true;
                }
                Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {}
                Err(err) => {
                    return Err(ToolError::tunnel_forward_failed(format!(
                        "local socket read failed: {}",
                        err
                    )));
                }
            }
        }

        match channel.read(&mut buf) {
            Ok(0) => {
                if channel.eof() {
                    break;
                }
            }
            Ok(n) => {
                write_all_retry(&mut tcp, &buf[..n], shutdown)?;
                progressed = true;
            }
            Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {}
            Err(err) => {
                return Err(ToolError::tunnel_forward_failed(format!(
                    "channel read failed: {}",
                    err
                )));
            }
        }

        if channel.eof() {
            break;
        }
        if !tcp_open && channel.eof() {
            break;
        }
        if !progressed {
            std::thread::sleep(Duration::from_millis(5));
        }
    }

    let _ = channel.close();
    Ok(())
}

/// `channel_direct_tcpip` on a non-blocking session needs a retry loop; the
/// open itself can report WouldBlock mid-negotiation.
fn open_direct_tcpip(
    session: &Session,
    remote_host: &str,
    remote_port: u16,
) -> Result<ssh2::Channel, ToolError> {
    let deadline = Instant::now() + Duration::from_millis(network::TUNNEL_OPEN_TIMEOUT_MS);
    loop {
        match session.channel_direct_tcpip(remote_host, remote_port, None) {
            Ok(channel) => return Ok(channel),
            Err(err) => {
                let io_err: std::io::Error = err.into();
                if io_err.kind() == std::io::ErrorKind::WouldBlock {
                    if Instant::now() > deadline {
                        return Err(ToolError::tunnel_forward_failed(
                            "Timed out opening direct-tcpip channel",
                        ));
                    }
                    std::thread::sleep(Duration::from_millis(10));
                    continue;
                }
                return Err(ToolError::tunnel_forward_failed(format!(
                    "Cannot open direct-tcpip channel to {}:{}: {}",
                    remote_host, remote_port, io_err
                )));
            }
        }
    }
}

fn write_all_retry<W: Write>(
    writer: &mut W,
    mut data: &[u8],
    shutdown: &AtomicBool,
) -> Result<(), ToolError> {
    while !data.is_empty() {
        if shutdown.load(Ordering::Relaxed) {
            return Err(ToolError::tunnel_forward_failed("tunnel shutting down"));
        }
        match writer.write(data) {
            Ok(0) => std::thread::sleep(Duration::from_millis(2)),
            Ok(n) => data = &data[n..],
            Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {
                std::thread::sleep(Duration::from_millis(2));
            }
            Err(err) => {
                return Err(ToolError::tunnel_forward_failed(format!(
                    "write failed: {}",
                    err
                )));
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::credentials::CredentialStore;
    use crate::services::security::Security;
    use crate::services::store::ConnectionStore;

    fn manager() -> TunnelManager {
        let logger = Logger::new("test");
        let dir = std::env::temp_dir().join(format!("broker-tun-{}", uuid::Uuid::new_v4()));
        let store =
            Arc::new(ConnectionStore::open(dir.join("connections.json")).expect("store"));
        let security = Arc::new(Security::from_key(&[9u8; 32]).expect("security"));
        let credentials = Arc::new(CredentialStore::with_encrypted_backend(
            logger.clone(),
            security,
            dir.join("credentials.json"),
        ));
        let registry = Arc::new(ConnectionRegistry::new(
            logger.clone(),
            store,
            credentials,
            EventBus::default(),
        ));
        TunnelManager::new(logger, registry, EventBus::default())
    }

    fn record_only_entry(manager: &TunnelManager, id: &str, local_port: u16) {
        manager.tunnels.insert(
            id.to_string(),
            TunnelEntry {
                record: TunnelRecord {
                    id: id.to_string(),
                    connection_id: "c1".to_string(),
                    local_port,
                    remote_host: "db".to_string(),
                    remote_port: 5432,
                    description: None,
                    active: true,
                    created_at: Utc::now().to_rfc3339(),
                },
                runtime: None,
            },
        );
    }

    #[test]
    fn duplicate_local_ports_are_rejected() {
        let manager = manager();
        record_only_entry(&manager, "t1", 18080);
        assert!(manager.ensure_port_free(18080).is_err());
        assert!(manager.ensure_port_free(18081).is_ok());
    }

    #[test]
    fn close_is_idempotent_and_frees_the_port() {
        let manager = manager();
        record_only_entry(&manager, "t1", 18080);
        assert!(manager.close("t1"));
        assert!(!manager.close("t1"));
        assert!(manager.ensure_port_free(18080).is_ok());
    }

    #[test]
    fn close_for_connection_takes_all_tunnels_down() {
        let manager = manager();
        record_only_entry(&manager, "t1", 18080);
        record_only_entry(&manager, "t2", 18081);
        assert_eq!(manager.close_for_connection("c1"), 2);
        assert!(manager.is_empty());
    }
}
