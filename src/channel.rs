//! Persistent realtime channel with reconnect backoff.

pub mod manager;
pub mod socket;
pub mod state;

pub use manager::{ChannelEvent, ChannelManager, ChannelSettings, ConnectionStatus};
pub use socket::{
    ChannelConnector, ChannelFault, ChannelFrame, ChannelSocket, CloseInfo, SocketEvent,
    WsConnector,
};
pub use state::ChannelState;
