use std::time::Duration;

pub const DEFAULT_WS_URL: &str = "wss://web.whatsapp.com/ws/chat";
pub const DEFAULT_ORIGIN: &str = "https://web.whatsapp.com";

#[derive(Clone, Debug)]
pub struct TransactionOptions {
    pub max_commit_retries: u32,
    pub delay_between_tries: Duration,
}

impl Default for TransactionOptions {
    fn default() -> Self {
        Self {
            max_commit_retries: 10,
            delay_between_tries: Duration::from_secs(3),
        }
    }
}

#[derive(Clone, Debug)]
pub struct SocketConfig {
    pub url: String,
    /// Bounds the handshake and every outbound send.
    pub connect_timeout: Duration,
    pub keep_alive_interval: Duration,
    /// Extra silence tolerated past `keep_alive_interval` before the
    /// connection is considered lost.
    pub keep_alive_grace: Duration,
    pub default_query_timeout: Duration,
    /// First delay applied after a rate-limit signal.
    pub backoff_delay: Duration,
    pub max_backoff_delay: Duration,
    pub transaction: TransactionOptions,
    pub mobile: bool,
    /// Login payload carried inside the handshake.
    pub client_payload: Vec<u8>,
}

impl Default for SocketConfig {
    fn default() -> Self {
        Self {
            url: DEFAULT_WS_URL.to_string(),
            connect_timeout: Duration::from_secs(20),
            keep_alive_interval: Duration::from_secs(30),
            keep_alive_grace: Duration::from_secs(5),
            default_query_timeout: Duration::from_secs(60),
            backoff_delay: Duration::from_secs(5),
            max_backoff_delay: Duration::from_secs(30),
            transaction: TransactionOptions::default(),
            mobile: false,
            client_payload: Vec::new(),
        }
    }
}
