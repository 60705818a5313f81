//! Call-side components: local capture, peer-connection negotiation, the
//! session controller and the relay transport.

pub mod media;
pub mod negotiation;
pub mod rtc;
pub mod session;
pub mod transport;

pub use media::{DeviceCapture, LocalMedia, LocalTrack, MediaCapture, MediaConstraints, MediaKind};
pub use negotiation::{Phase, Role};
pub use rtc::{PeerFactory, PeerTransport, RtcPeerFactory};
pub use session::{SessionController, SessionEvent};
pub use transport::{RelayClient, RelayEvent, SignalSink};
