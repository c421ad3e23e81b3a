pub mod branch_cache;
pub mod conn;
pub mod framing;
pub mod listener;
pub mod udp_pool;

pub use branch_cache::{transaction_branch, BranchCache, MAGIC_COOKIE};
pub use conn::{Conn, ConnId, Transport};
pub use listener::{Incoming, Listener};
pub use udp_pool::UdpPool;
