//! Wire protocol: packet framing, the message envelope and routes.

pub mod message;
pub mod packet;
pub mod route;

pub use message::{Message, MessageKind, Route};
pub use packet::{Packet, PacketType};
pub use route::{RouteDict, RouteInfo};
