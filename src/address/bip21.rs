//! BIP21 payment URI parsing, used to prefill a recipient.

use std::str::FromStr;

use miniscript::bitcoin::{Amount, Denomination};
use serde::Serialize;

use super::parse_address;
use crate::error::SendError;
use crate::networks::Network;
use crate::types::Recipient;

const SCHEME: &str = "bitcoin:";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentUri {
    pub address: String,
    pub amount_sats: Option<u64>,
    pub label: Option<String>,
    pub message: Option<String>,
}

impl PaymentUri {
    /// Recipient row for the send form. A missing amount becomes zero.
    pub fn to_recipient(&self) -> Recipient {
        Recipient {
            address: self.address.clone(),
            amount: self.amount_sats.unwrap_or(0),
            label: self.label.clone().or_else(|| self.message.clone()),
        }
    }
}

fn malformed(uri: &str, reason: impl Into<String>) -> SendError {
    SendError::InvalidAddress {
        address: uri.to_string(),
        reason: reason.into(),
    }
}

fn percent_decode(input: &str) -> Result<String, String> {
    let bytes = input.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'%' => {
                let hex = input
                    .get(i + 1..i + 3)
                    .ok_or_else(|| "truncated percent escape".to_string())?;
                let byte = u8::from_str_radix(hex, 16)
                    .map_err(|_| format!("invalid percent escape %{}", hex))?;
                out.push(byte);
                i += 3;
            }
            b => {
                out.push(b);
                i += 1;
            }
        }
    }
    String::from_utf8(out).map_err(|_| "percent escape is not valid UTF-8".to_string())
}

/// Parses `bitcoin:<address>?amount=<btc>&label=<text>&message=<text>`.
///
/// A bare address is accepted as a URI without parameters.
pub fn parse_payment_uri(uri: &str, network: Network) -> Result<PaymentUri, SendError> {
    let trimmed = uri.trim();
    let body = match trimmed.get(..SCHEME.len()) {
        Some(prefix) if prefix.eq_ignore_ascii_case(SCHEME) => &trimmed[SCHEME.len()..],
        _ => trimmed,
    };
    let (address_part, query) = match body.split_once('?') {
        Some((a, q)) => (a, Some(q)),
        None => (body, None),
    };

    let address = parse_address(address_part, network)?.to_string();
    let mut parsed = PaymentUri {
        address,
        amount_sats: None,
        label: None,
        message: None,
    };

    for pair in query.into_iter().flat_map(|q| q.split('&')) {
        if pair.is_empty() {
            continue;
        }
        let (key, raw_value) = pair.split_once('=').unwrap_or((pair, ""));
        let value = percent_decode(raw_value).map_err(|e| malformed(uri, e))?;
        match key.to_ascii_lowercase().as_str() {
            "amount" => {
                let amount = Amount::from_str_in(&value, Denomination::Bitcoin)
                    .map_err(|e| malformed(uri, format!("invalid amount: {}", e)))?;
                parsed.amount_sats = Some(amount.to_sat());
            }
            "label" => parsed.label = Some(value),
            "message" => parsed.message = Some(value),
            k if k.starts_with("req-") => {
                return Err(malformed(uri, format!("unsupported required parameter {}", key)));
            }
            _ => {}
        }
    }

    Ok(parsed)
}

impl FromStr for PaymentUri {
    type Err = SendError;

    /// Parses against mainnet.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        parse_payment_uri(s, Network::Bitcoin)
    }
}
