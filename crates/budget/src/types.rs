use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;
use hex::{encode as hex_encode, decode as hex_decode};
use std::ops::Add;
use anyhow::Result;

/// Hash type: sha3-256 digest wrapper (32 bytes)
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct Hash(pub [u8; 32]);

impl Hash {
    pub fn from_bytes(b: [u8; 32]) -> Self { Hash(b) }
    pub fn as_bytes(&self) -> &[u8; 32] { &self.0 }
    pub fn to_hex(&self) -> String { hex_encode(self.0) }
    pub fn zero() -> Self { Hash([0u8; 32]) }
    pub fn is_zero(&self) -> bool { self.0 == [0u8; 32] }
}

impl fmt::Display for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}
impl fmt::Debug for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Hash").field(&self.to_hex()).finish()
    }
}

impl FromStr for Hash {
    type Err = anyhow::Error;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.strip_prefix("0x").unwrap_or(s);
        let v = hex_decode(s)?;
        if v.len() != 32 { anyhow::bail!("invalid sha3-256 length: {}", v.len()); }
        let mut arr = [0u8; 32];
        arr.copy_from_slice(&v);
        Ok(Hash(arr))
    }
}

/* serde impls for Hash as hex string */
impl Serialize for Hash {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where S: Serializer {
        serializer.serialize_str(&self.to_hex())
    }
}
impl<'de> Deserialize<'de> for Hash {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Hash, D::Error>
    where D: Deserializer<'de> {
        let s = String::deserialize(deserializer)?;
        Hash::from_str(&s).map_err(serde::de::Error::custom)
    }
}

/// Amount newtype (smallest units). 8 decimals scale factor defined below.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Debug, Default)]
pub struct Amount(pub u128);

impl Amount {
    pub fn new_raw(v: u128) -> Self { Amount(v) }
    pub fn zero() -> Self { Amount(0u128) }
    pub fn as_u128(&self) -> u128 { self.0 }
    pub fn checked_add(self, rhs: Amount) -> Option<Amount> { self.0.checked_add(rhs.0).map(Amount) }
    pub fn checked_sub(self, rhs: Amount) -> Option<Amount> { self.0.checked_sub(rhs.0).map(Amount) }
    pub fn saturating_add(self, rhs: Amount) -> Amount { Amount(self.0.saturating_add(rhs.0)) }
}

impl Add for Amount {
    type Output = Self;
    fn add(self, rhs: Self) -> Self::Output { Amount(self.0 + rhs.0) }
}

impl fmt::Display for Amount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/* Implement serde for Amount simply */
impl Serialize for Amount {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where S: Serializer {
        serializer.serialize_u128(self.0)
    }
}
impl<'de> Deserialize<'de> for Amount {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Amount, D::Error>
    where D: Deserializer<'de> {
        let v = u128::deserialize(deserializer)?;
        Ok(Amount(v))
    }
}

/// exposed constants for amounts
pub const DECIMALS: u32 = 8;
pub const COIN: u128 = 10u128.pow(DECIMALS);

/// Current unix time in seconds.
pub fn current_unix_time() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

/// Reference to a specific transaction output. A masternode is identified by
/// the outpoint of its collateral, so this doubles as the voter key.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Debug, Serialize, Deserialize)]
pub struct OutPoint {
    pub txid: Hash,
    pub vout: u32,
}

impl OutPoint {
    pub fn new(txid: Hash, vout: u32) -> Self { OutPoint { txid, vout } }

    /// Short display form used in signed vote messages. Must stay stable:
    /// changing it invalidates every signature on the network.
    pub fn to_string_short(&self) -> String {
        format!("{}-{}", &self.to_hex_prefix(16), self.vout)
    }

    fn to_hex_prefix(&self, n: usize) -> String {
        let full = self.txid.to_hex();
        full[..n.min(full.len())].to_string()
    }
}

impl fmt::Display for OutPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.txid, self.vout)
    }
}

/// Output script, reduced to the three shapes the budget layer cares about.
///
/// - `PayToPubkeyHash` / `PayToScriptHash` are the normal payment scripts.
/// - `OpReturn` is the unspendable shape used to commit a collateral binding
///   hash on chain.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Debug, Serialize, Deserialize)]
pub enum Script {
    PayToPubkeyHash([u8; 20]),
    PayToScriptHash([u8; 20]),
    OpReturn(Vec<u8>),
}

impl Script {
    /// Unspendable output committing to a 32-byte binding hash.
    pub fn op_return(binding: &Hash) -> Self {
        Script::OpReturn(binding.as_bytes().to_vec())
    }

    pub fn is_normal_payment(&self) -> bool {
        matches!(self, Script::PayToPubkeyHash(_) | Script::PayToScriptHash(_))
    }

    pub fn is_unspendable(&self) -> bool {
        matches!(self, Script::OpReturn(_))
    }

    pub fn is_pay_to_script_hash(&self) -> bool {
        matches!(self, Script::PayToScriptHash(_))
    }

    /// Extract the destination key hash. Only defined for key-hash payments;
    /// script-hash destinations are not extractable here.
    pub fn destination(&self) -> Option<[u8; 20]> {
        match self {
            Script::PayToPubkeyHash(kh) => Some(*kh),
            _ => None,
        }
    }

    /// Human-readable destination for logs.
    pub fn destination_display(&self) -> String {
        match self.destination() {
            Some(kh) => hex_encode(kh),
            None => "<non-standard>".to_string(),
        }
    }
}

/// Single transaction output.
#[derive(Clone, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub struct TxOut {
    pub value: Amount,
    pub script: Script,
}

impl TxOut {
    pub fn new(value: Amount, script: Script) -> Self { TxOut { value, script } }
}

/// Minimal transaction view: everything the budget layer inspects.
/// Collateral checks read `lock_time` and `outputs`; payment validation
/// scans `outputs`; block filling appends to `outputs`.
#[derive(Clone, PartialEq, Eq, Debug, Default, Serialize, Deserialize)]
pub struct Transaction {
    pub lock_time: u32,
    pub outputs: Vec<TxOut>,
}

impl Transaction {
    pub fn new(outputs: Vec<TxOut>) -> Self {
        Transaction { lock_time: 0, outputs }
    }
}
