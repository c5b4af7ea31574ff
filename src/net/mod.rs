//! Network event sources. Only TCP is implemented, matching the original
//! scope ("should be available for all architectures"); UDP/MQTT-style
//! managers would live here too in a fuller stack.

mod tcp;

pub use tcp::{ConnectionCallback, ConnectionId, Direction, NetworkBuffer, TcpConnectionManager};
