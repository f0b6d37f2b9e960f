pub mod network {
    pub const SSH_DEFAULT_PORT: u16 = 22;
    pub const TIMEOUT_READY_MS: u64 = 10_000;
    pub const TIMEOUT_COMMAND_MS: u64 = 10_000;
    pub const TIMEOUT_PROBE_MS: u64 = 5_000;
    pub const TIMEOUT_EXEC_HARD_GRACE_MS: u64 = 2_000;
    pub const KEEPALIVE_INTERVAL_MS: u64 = 30_000;
    pub const RECONNECT_ATTEMPTS: u32 = 3;
    pub const RECONNECT_DELAY_MS: u64 = 5_000;
    pub const BACKGROUND_INTERVAL_MS: u64 = 10_000;
    pub const TUNNEL_OPEN_TIMEOUT_MS: u64 = 10_000;
}

pub mod limits {
    pub const MIN_PORT: u16 = 1;
    pub const MAX_PORT: u16 = 65_535;
    pub const MAX_CAPTURE_BYTES: usize = 256 * 1024;
    pub const MAX_RENDERED_CHARS: usize = 10_000;
    pub const RENDERED_HEAD_CHARS: usize = 3_000;
    pub const RENDERED_TAIL_CHARS: usize = 3_000;
    pub const TRANSFER_CHUNK_BYTES: usize = 32 * 1024;
    pub const PROGRESS_STEP_PERCENT: u8 = 5;
}

pub mod sweep {
    pub const JANITOR_INTERVAL_MS: u64 = 60_000;
    pub const TRANSFER_RETENTION_MS: i64 = 3_600_000;
    pub const TERMINAL_IDLE_MS: i64 = 24 * 3_600_000;
    pub const CONTAINER_IDLE_MS: i64 = 30 * 60_000;
    pub const CONTAINER_CACHE_TTL_MS: u64 = 30_000;
}

pub mod tmux {
    pub const SETTLE_DELAY_MS: u64 = 300;
    pub const BLOCKED_CAPTURE_LINES: i32 = 10;
    pub const CONTEXT_WINDOW_LINES: usize = 10;
}

pub mod crypto {
    pub const KEY_SIZE: usize = 32;
    pub const IV_SIZE: usize = 12;
    pub const TAG_SIZE: usize = 16;
}

pub mod keyring_service {
    pub const PASSWORD_SERVICE: &str = "mcp-ssh";
    pub const PASSPHRASE_SERVICE: &str = "mcp-ssh-passphrase";
}

fn env_u64(name: &str) -> Option<u64> {
    std::env::var(name).ok().and_then(|v| v.parse::<u64>().ok())
}

pub fn resolve_default_port() -> u16 {
    std::env::var("DEFAULT_SSH_PORT")
        .ok()
        .and_then(|v| v.parse::<u16>().ok())
        .unwrap_or(network::SSH_DEFAULT_PORT)
}

pub fn resolve_connection_timeout_ms() -> u64 {
    env_u64("CONNECTION_TIMEOUT").unwrap_or(network::TIMEOUT_READY_MS)
}

pub fn resolve_reconnect_attempts() -> u32 {
    std::env::var("RECONNECT_ATTEMPTS")
        .ok()
        .and_then(|v| v.parse::<u32>().ok())
        .unwrap_or(network::RECONNECT_ATTEMPTS)
}

pub fn resolve_command_timeout_ms() -> u64 {
    env_u64("COMMAND_TIMEOUT").unwrap_or(network::TIMEOUT_COMMAND_MS)
}
