use anyhow::{anyhow, bail, Result};

use crate::sip::protocols::{parse_params, HeaderCodec};

#[derive(Debug, Clone)]
pub struct ViaHeader {
    pub sent_protocol: String,
    pub sent_by: String,
    pub params: Vec<(String, String)>,
}

impl ViaHeader {
    /// パラメータ名は大文字小文字を区別しない
    pub fn param(&self, name: &str) -> Option<&str> {
        self.params
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn branch(&self) -> Option<&str> {
        self.param("branch").filter(|b| !b.is_empty())
    }
}

impl HeaderCodec for ViaHeader {
    const NAME: &'static str = "Via";

    fn parse(value: &str) -> Result<Self> {
        // 例: "SIP/2.0/UDP 192.0.2.1:5060;branch=z9hG4bK123;rport"
        let value = value.trim();
        let mut parts = value.splitn(2, |c: char| c.is_ascii_whitespace());
        let proto = parts
            .next()
            .ok_or_else(|| anyhow!("Via missing protocol"))?
            .trim();
        let rest = parts
            .next()
            .ok_or_else(|| anyhow!("Via missing sent-by"))?
            .trim();

        if proto.split('/').count() != 3 || !proto.starts_with("SIP/") {
            bail!("Via has malformed sent-protocol {:?}", proto);
        }

        let (sent_by, params) = match rest.find(';') {
            Some(idx) => (rest[..idx].trim(), parse_params(&rest[idx + 1..])),
            None => (rest, Vec::new()),
        };
        if sent_by.is_empty() {
            bail!("Via missing sent-by");
        }

        Ok(ViaHeader {
            sent_protocol: proto.to_string(),
            sent_by: sent_by.to_string(),
            params,
        })
    }
}
