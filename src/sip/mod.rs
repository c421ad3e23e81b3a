pub mod message;
pub mod parse;
pub mod protocols;

pub use message::{SipHeader, SipMessage, SipMethod, SipRequest, SipResponse};
pub use parse::{parse_request, parse_sip_message, parse_via_header};
pub use protocols::{HeaderCodec, ViaHeader};
