pub mod bt_discovery;
pub mod memory;
pub mod rfcomm;
pub mod tcp;
pub mod traits;

pub use bt_discovery::{open_default_adapter, BluezRadio, DiscoveredPeer};
pub use memory::{MemoryRadio, MemoryTransport, PeerBehavior};
pub use rfcomm::{RfcommConfig, RfcommTransport, DEFAULT_RFCOMM_CHANNEL};
pub use tcp::TcpTransport;
pub use traits::{NullRadio, RadioAdapter, Transport, TransportListener, TransportStream};
