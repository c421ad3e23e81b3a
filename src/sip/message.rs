use std::fmt;

use crate::sip::protocols::{HeaderCodec, ViaHeader};

#[derive(Debug, Clone)]
// Request or Response の種別
pub enum SipMessage {
    Request(SipRequest),
    Response(SipResponse),
}

#[derive(Debug, Clone)]
pub struct SipRequest {
    pub method: SipMethod,
    pub uri: String,
    pub version: String,
    pub headers: Vec<SipHeader>,
    pub body: Vec<u8>,
}

#[derive(Debug, Clone)]
pub struct SipResponse {
    pub version: String,
    pub status_code: u16,
    pub reason_phrase: String,
    pub headers: Vec<SipHeader>,
    pub body: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SipMethod {
    Invite,
    Ack,
    Bye,
    Cancel,
    Options,
    Register,
    Unknown(String),
}

impl SipMethod {
    pub fn as_str(&self) -> &str {
        match self {
            SipMethod::Invite => "INVITE",
            SipMethod::Ack => "ACK",
            SipMethod::Bye => "BYE",
            SipMethod::Cancel => "CANCEL",
            SipMethod::Options => "OPTIONS",
            SipMethod::Register => "REGISTER",
            SipMethod::Unknown(token) => token,
        }
    }
}

impl fmt::Display for SipMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone)]
pub struct SipHeader {
    pub name: String,
    pub value: String,
}

impl SipHeader {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }
}

/// 短縮形ヘッダ名 (RFC 3261 §7.3.3) を正式名へ寄せる
fn canonical_header_name(name: &str) -> &str {
    match name {
        "v" | "V" => "Via",
        "i" | "I" => "Call-ID",
        "l" | "L" => "Content-Length",
        "f" | "F" => "From",
        "t" | "T" => "To",
        "m" | "M" => "Contact",
        _ => name,
    }
}

impl SipRequest {
    /// Returns the value of the first header called `name` (compact forms included).
    pub fn header_value(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|h| canonical_header_name(&h.name).eq_ignore_ascii_case(name))
            .map(|h| h.value.as_str())
    }

    /// Topmost Via entry. A header line may carry several comma separated
    /// Via values; only the first one identifies the transaction.
    pub fn top_via(&self) -> Option<&str> {
        let value = self.header_value(ViaHeader::NAME)?;
        value.split(',').next().map(str::trim).filter(|v| !v.is_empty())
    }
}
