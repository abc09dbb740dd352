//! Room control plane
//!
//! Everything above the RPC channel: the connection hub, the tunnel broker
//! with its endpoint and alias state, per-connection sessions, the method
//! dispatcher and the room server tying them together. [`RoomClient`] is the
//! peer side of the same protocol.

pub mod aliases;
pub mod bridge;
pub mod broker;
pub mod client;
pub mod config;
pub mod dispatch;
pub mod hub;
pub mod membership;
pub mod room;
pub mod session;

pub use aliases::{AliasRecord, AliasTable};
pub use bridge::{SignInBridge, SignInEvent};
pub use broker::{splice, BrokerConfig, EndpointFeed, Tunnel, TunnelBroker};
pub use client::{IncomingTunnel, RoomClient};
pub use config::{ConfigError, DuplicatePolicy, RoomConfig};
pub use dispatch::RoomHandler;
pub use hub::{
    Admission, Connection, ConnectionInfo, Direction, LifecycleEvent, LifecycleFeed, PeerHub,
    TransportKind,
};
pub use membership::Membership;
pub use room::Room;
pub use session::{Session, SessionState, TunnelState};
