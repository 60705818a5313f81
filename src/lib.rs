pub mod client;
pub mod config;
pub mod error;
pub mod http;
pub mod protocol;
pub mod registry;
pub mod relay;
pub mod socket;
pub mod telemetry;

use std::time::Instant;

use config::RelayConfig;
use relay::Relay;
use socket::SocketIoOutbound;

// ─── AppState ───────────────────────────────────────────────────────────────

pub struct AppState {
    pub relay: Relay<SocketIoOutbound>,
    pub config: RelayConfig,
    pub started_at: Instant,
}
