pub mod codec;
pub mod conn;
pub mod socket;

pub use codec::{Echo, Incoming, Unreachable};
pub use conn::{Conn, PacketHandler};
pub use socket::IcmpSocket;
