pub mod connector;
pub mod manager;
pub mod memory;
pub mod reconnect;

pub use connector::{Connection, Connector, WebSocketConnector};
pub use manager::{ChannelEvent, ChannelManager, ChannelSender, FRAME_BUFFER};
pub use memory::{MemoryConnector, MemoryPeer, MemoryPeers};
pub use reconnect::ReconnectPolicy;
