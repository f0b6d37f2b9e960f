use crate::constants::{limits, network};
use crate::errors::ToolError;
use sha2::Digest;
use ssh2::Session;
use std::io::Read;
use std::net::{TcpStream, ToSocketAddrs};
use std::time::{Duration, Instant};

/// Everything needed to dial one SSH endpoint. Secrets stay in memory only.
#[derive(Debug, Clone)]
pub struct ConnectSettings {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: Option<String>,
    pub private_key: Option<String>,
    pub passphrase: Option<String>,
    pub ready_timeout_ms: u64,
    pub keepalive_interval_ms: u64,
}

/// Deterministic connection identity: sha256 over `user@host:port`.
pub fn connection_id(username: &str, host: &str, port: u16) -> String {
    let digest = sha2::Sha256::digest(format!("{}@{}:{}", username, host, port).as_bytes());
    hex::encode(digest)[..16].to_string()
}

pub fn connect_session(settings: &ConnectSettings) -> Result<Session, ToolError> {
    let addr = format!("{}:{}", settings.host, settings.port);
    let resolved = addr
        .to_socket_addrs()
        .map_err(|err| ToolError::connect_failed(format!("Failed to resolve {}: {}", addr, err)))?
        .next()
        .ok_or_else(|| ToolError::connect_failed(format!("No address for {}", addr)))?;
    let tcp = TcpStream::connect_timeout(
        &resolved,
        Duration::from_millis(settings.ready_timeout_ms),
    )
    .map_err(|err| ToolError::connect_failed(format!("Failed to connect to {}: {}", addr, err)))?;
    tcp.set_read_timeout(Some(Duration::from_millis(settings.ready_timeout_ms)))
        .ok();
    tcp.set_write_timeout(Some(Duration::from_millis(settings.ready_timeout_ms)))
        .ok();

    let mut session = Session::new()
        .map_err(|_| ToolError::internal("Failed to create SSH session"))?;
    session.set_tcp_stream(tcp);
    session
        .handshake()
        .map_err(|err| ToolError::connect_failed(format!("SSH handshake failed: {}", err)))?;

    if let Some(key) = settings.private_key.as_ref() {
        session
            .userauth_pubkey_memory(
                &settings.username,
                None,
                key,
                settings.passphrase.as_deref(),
            )
            .map_err(|err| ToolError::auth_failed(format!("Key authentication failed: {}", err)))?;
    } else if let Some(password) = settings.password.as_ref() {
        session
            .userauth_password(&settings.username, password)
            .map_err(|_| ToolError::auth_failed("Password authentication failed"))?;
    } else {
        return Err(ToolError::auth_failed(
            "No password or private key available for authentication",
        ));
    }

    if !session.authenticated() {
        return Err(ToolError::auth_failed("SSH authentication failed"));
    }
    let interval = std::cmp::max(1, (settings.keepalive_interval_ms / 1000) as u32);
    session.set_keepalive(true, interval);
    Ok(session)
}

pub fn host_key_fingerprint(session: &Session) -> Option<String> {
    use base64::Engine;
    let hash = session.host_key_hash(ssh2::HashType::Sha256)?;
    let encoded = base64::engine::general_purpose::STANDARD_NO_PAD.encode(hash);
    Some(format!("SHA256:{}", encoded))
}

#[derive(Debug, Clone)]
pub struct ExecOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i64,
    pub timed_out: bool,
    pub duration_ms: u64,
}

/// Run one command on an `exec` channel, collecting both streams with a
/// deadline. The session is flipped to non-blocking for the read loop and
/// restored before returning, since callers keep it alive.
pub fn exec_on_session(
    session: &Session,
    command: &str,
    timeout_ms: u64,
) -> Result<ExecOutput, ToolError> {
    session.set_blocking(true);
    let mut channel = session.channel_session().map_err(map_ssh_error)?;
    channel.exec(command).map_err(map_ssh_error)?;
    session.set_blocking(false);

    let mut stdout = Vec::new();
    let mut stderr = Vec::new();
    let mut stderr_stream = channel.stderr();
    let started = Instant::now();
    let mut timed_out = false;
    let mut buf = [0u8; 8192];

    loop {
        let mut progressed = false;
        match channel.read(&mut buf) {
            Ok(n) if n > 0 => {
                append_capped(&mut stdout, &buf[..n]);
                progressed = true;
            }
            Ok(_) => {}
            Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {}
            Err(err) => {
                session.set_blocking(true);
                return Err(ToolError::internal(format!("SSH stdout read failed: {}", err)));
            }
        }
        match stderr_stream.read(&mut buf) {
            Ok(n) if n > 0 => {
                append_capped(&mut stderr, &buf[..n]);
                progressed = true;
            }
            Ok(_) => {}
            Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {}
            Err(err) => {
                session.set_blocking(true);
                return Err(ToolError::internal(format!("SSH stderr read failed: {}", err)));
            }
        }

        if channel.eof() {
            break;
        }
        if started.elapsed().as_millis() as u64 > timeout_ms {
            timed_out = true;
            break;
        }
        if !progressed {
            std::thread::sleep(Duration::from_millis(20));
        }
    }

    if timed_out {
        let _ = channel.close();
        let deadline = Instant::now() + Duration::from_millis(network::TIMEOUT_EXEC_HARD_GRACE_MS);
        while Instant::now() < deadline && !channel.eof() {
            std::thread::sleep(Duration::from_millis(20));
        }
    }

    session.set_blocking(true);
    let _ = channel.wait_close();
    let exit_code = if timed_out {
        1
    } else {
        i64::from(channel.exit_status().unwrap_or(-1))
    };

    let mut stderr_text = String::from_utf8_lossy(&stderr).to_string();
    if timed_out {
        if !stderr_text.is_empty() && !stderr_text.ends_with('\n') {
            stderr_text.push('\n');
        }
        stderr_text.push_str(&format!("command timed out after {}ms", timeout_ms));
    }

    Ok(ExecOutput {
        stdout: String::from_utf8_lossy(&stdout).to_string(),
        stderr: stderr_text,
        exit_code,
        timed_out,
        duration_ms: started.elapsed().as_millis() as u64,
    })
}

fn append_capped(buffer: &mut Vec<u8>, chunk: &[u8]) {
    let remaining = limits::MAX_CAPTURE_BYTES.saturating_sub(buffer.len());
    if remaining == 0 {
        return;
    }
    let take = chunk.len().min(remaining);
    buffer.extend_from_slice(&chunk[..take]);
}

pub fn map_ssh_error(err: ssh2::Error) -> ToolError {
    let io_err: std::io::Error = err.into();
    match io_err.kind() {
        std::io::ErrorKind::TimedOut => ToolError::timeout("SSH operation timed out"),
        std::io::ErrorKind::WouldBlock => ToolError::retryable("SSH operation would block"),
        _ => ToolError::internal(format!("SSH error: {}", io_err)),
    }
}

#[cfg(test)]
mod tests {
    use super::connection_id;

    #[test]
    fn connection_id_is_deterministic() {
        let a = connection_id("u", "h", 22);
        let b = connection_id("u", "h", 22);
        assert_eq!(a, b);
        assert_eq!(a.len(), 16);
    }

    #[test]
    fn connection_id_varies_with_identity() {
        assert_ne!(connection_id("u", "h", 22), connection_id("u", "h", 2222));
        assert_ne!(connection_id("u", "h", 22), connection_id("v", "h", 22));
    }
}
