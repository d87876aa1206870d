use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{error::ClientError, metadata::CampaignMetadata, units::Octas};

pub type Address = String;

/// Canonical form: `0x` + 1..=64 lowercase hex digits.
pub fn normalize_address(input: &str) -> Result<Address, ClientError> {
    let trimmed = input.trim();
    let digits = trimmed
        .strip_prefix("0x")
        .or_else(|| trimmed.strip_prefix("0X"))
        .ok_or_else(|| ClientError::InvalidInput(format!("address {input:?} lacks 0x prefix")))?;
    if digits.is_empty() || digits.len() > 64 || !digits.chars().all(|c| c.is_ascii_hexdigit()) {
        return Err(ClientError::InvalidInput(format!(
            "address {input:?} is not 1-64 hex digits"
        )));
    }
    Ok(format!("0x{}", digits.to_ascii_lowercase()))
}

/// Address equality that ignores case and leading zeros (`0x1 == 0x0001`).
pub fn same_address(a: &str, b: &str) -> bool {
    fn core(s: &str) -> String {
        let s = s.trim();
        let digits = s
            .strip_prefix("0x")
            .or_else(|| s.strip_prefix("0X"))
            .unwrap_or(s);
        let digits = digits.trim_start_matches('0');
        digits.to_ascii_lowercase()
    }
    core(a) == core(b)
}

/// `0x1234...abcd`
pub fn short_address(address: &str) -> String {
    if address.len() <= 10 || !address.is_ascii() {
        return address.to_string();
    }
    format!("{}...{}", &address[..6], &address[address.len() - 4..])
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct CampaignRecord {
    pub address: Address,
    pub creator: Address,
    pub goal: Octas,
    pub total_raised: Octas,
    pub deadline_timestamp: u64,
    pub metadata: CampaignMetadata,
    pub funds_claimed: bool,
    pub total_refunded: Octas,
    pub escrow_balance: Octas,
}

impl CampaignRecord {
    /// Normalizes the `get_campaign_info` tuple:
    /// `(creator, goal, total_raised, deadline, metadata, funds_claimed,
    /// total_refunded, escrow_balance)`.
    pub fn from_view(address: &str, values: &[Value]) -> Result<Self, ClientError> {
        const QUERY: &str = "get_campaign_info";
        if values.len() < 8 {
            return Err(ClientError::malformed(
                QUERY,
                format!("expected 8 values, got {}", values.len()),
            ));
        }
        let metadata_blob = values[4].as_str().unwrap_or_default();
        let record = Self {
            address: address.to_string(),
            creator: string_at(QUERY, values, 0)?,
            goal: u64_at(QUERY, values, 1)?,
            total_raised: u64_at(QUERY, values, 2)?,
            deadline_timestamp: u64_at(QUERY, values, 3)?,
            metadata: CampaignMetadata::parse(metadata_blob),
            funds_claimed: bool_at(QUERY, values, 5)?,
            total_refunded: u64_at(QUERY, values, 6)?,
            escrow_balance: u64_at(QUERY, values, 7)?,
        };
        if record.total_refunded > record.total_raised {
            return Err(ClientError::malformed(
                QUERY,
                "total_refunded exceeds total_raised",
            ));
        }
        Ok(record)
    }
}

/// One backer's contribution to one campaign. The zero value stands for
/// "no pledge".
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct BackerPledge {
    pub amount: Octas,
    pub refunded: bool,
}

impl BackerPledge {
    pub fn from_view(values: &[Value]) -> Result<Self, ClientError> {
        const QUERY: &str = "get_backer_pledge";
        Ok(Self {
            amount: u64_at(QUERY, values, 0)?,
            refunded: bool_at(QUERY, values, 1)?,
        })
    }
}

/// Move `u64` values arrive as decimal strings; plain numbers are accepted too.
pub(crate) fn as_u64(value: &Value) -> Option<u64> {
    match value {
        Value::String(s) => s.parse().ok(),
        Value::Number(n) => n.as_u64(),
        _ => None,
    }
}

pub(crate) fn u64_at(query: &str, values: &[Value], idx: usize) -> Result<u64, ClientError> {
    values
        .get(idx)
        .and_then(as_u64)
        .ok_or_else(|| ClientError::malformed(query, format!("value {idx} is not a u64")))
}

pub(crate) fn bool_at(query: &str, values: &[Value], idx: usize) -> Result<bool, ClientError> {
    values
        .get(idx)
        .and_then(Value::as_bool)
        .ok_or_else(|| ClientError::malformed(query, format!("value {idx} is not a bool")))
}

fn string_at(query: &str, values: &[Value], idx: usize) -> Result<String, ClientError> {
    values
        .get(idx)
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| ClientError::malformed(query, format!("value {idx} is not a string")))
}

/// First value of a view result as a list of addresses.
pub(crate) fn address_list(query: &str, values: &[Value]) -> Result<Vec<Address>, ClientError> {
    let items = values
        .first()
        .and_then(Value::as_array)
        .ok_or_else(|| ClientError::malformed(query, "expected an address vector"))?;
    items
        .iter()
        .map(|item| {
            item.as_str()
                .map(str::to_string)
                .ok_or_else(|| ClientError::malformed(query, "address is not a string"))
        })
        .collect()
}
