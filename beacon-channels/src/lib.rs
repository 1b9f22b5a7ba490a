//! Beacon transports.
//!
//! One adapter per platform behind the [`Transport`] trait, the UDP mesh
//! listener, and the [`Dispatcher`] that sequences build, sign, guard and
//! deliver.

pub mod bottube;
pub mod clawnews;
pub mod discord;
pub mod dispatch;
pub mod http;
pub mod mesh;
pub mod poll;
pub mod rustchain;
pub mod traits;
pub mod udp;

pub use bottube::BottubeTransport;
pub use clawnews::ClawNewsTransport;
pub use discord::DiscordTransport;
pub use dispatch::{ActionRequest, DispatchReport, Dispatcher, MirrorStatus, Platform};
pub use mesh::{BoundMeshListener, ListenerState, ListenerStats, MeshListener};
pub use rustchain::RustChainTransport;
pub use traits::{Cursor, Incoming, IncomingStream, Receipt, Transport};
pub use udp::UdpTransport;
