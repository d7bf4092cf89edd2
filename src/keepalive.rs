use crate::client::Client;
use crate::error::EngineError;
use crate::iq::PingSpec;
use log::{debug, warn};
use std::sync::Arc;
use tokio::time::{Instant, MissedTickBehavior};

impl Client {
    /// Sends a single keepalive ping. Failures are only logged; a dead link
    /// is detected by the silence check in [`keepalive_loop`](Self::keepalive_loop).
    async fn send_keepalive(&self) {
        debug!(target: "Client/Keepalive", "Sending keepalive ping");
        let ping = PingSpec {
            timeout: Some(self.config().keep_alive_interval),
        };
        match self.execute(&ping).await {
            Ok(()) => debug!(target: "Client/Keepalive", "Received keepalive pong"),
            Err(e) => warn!(target: "Client/Keepalive", "Keepalive ping failed: {e}"),
        }
    }

    /// Runs for the life of the connection. Each tick either ends the
    /// connection after too long without inbound traffic or sends a ping.
    pub(crate) async fn keepalive_loop(self: Arc<Self>) {
        let interval = self.config().keep_alive_interval;
        let allowed_silence = interval + self.config().keep_alive_grace;

        let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            ticker.tick().await;
            if self.is_closed() {
                debug!(target: "Client/Keepalive", "Client closed, exiting keepalive loop.");
                return;
            }

            let silence = self.last_received().elapsed();
            if silence > allowed_silence {
                warn!(target: "Client/Keepalive", "Nothing received for {silence:?}, connection lost");
                self.end(Some(EngineError::ConnectionLost));
                return;
            }

            if self.is_ready() {
                // a slow pong must not hold up the next silence check
                let client = self.clone();
                tokio::spawn(async move { client.send_keepalive().await });
            } else {
                warn!(target: "Client/Keepalive", "keep alive called when socket not open");
            }
        }
    }
}
