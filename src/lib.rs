pub mod config;
pub mod error;
pub mod logging;
pub mod sip;
pub mod transport;

pub use error::ListenerError;
pub use transport::{Conn, Incoming, Listener, Transport};
