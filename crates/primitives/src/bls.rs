//! Hex-packed curve points and signatures as the native chain reports them.
//!
//! The native daemon hands these out as concatenated big-endian 32-byte
//! words; the contract takes them as separate `uint256` arguments. Nothing
//! here checks that the values are valid curve points.

use std::fmt;

use alloy_primitives::U256;

use crate::contracts::{BLSSignatureParams, G1Point};

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum HexWordsError {
    Empty,
    Length { expected: usize, actual: usize },
    InvalidHex,
}

impl fmt::Display for HexWordsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HexWordsError::Empty => write!(f, "value is empty"),
            HexWordsError::Length { expected, actual } => {
                write!(f, "expected {expected} hex characters, got {actual}")
            }
            HexWordsError::InvalidHex => write!(f, "value contains non-hex characters"),
        }
    }
}

impl std::error::Error for HexWordsError {}

/// Splits `raw` (optionally `0x`-prefixed) into exactly `N` big-endian words.
pub fn hex_words<const N: usize>(raw: &str) -> Result<[U256; N], HexWordsError> {
    let raw = raw.trim();
    let digits = raw.strip_prefix("0x").unwrap_or(raw);
    if digits.is_empty() {
        return Err(HexWordsError::Empty);
    }
    if digits.len() != N * 64 {
        return Err(HexWordsError::Length {
            expected: N * 64,
            actual: digits.len(),
        });
    }
    let bytes = hex::decode(digits).map_err(|_| HexWordsError::InvalidHex)?;
    let mut out = [U256::ZERO; N];
    for (slot, chunk) in out.iter_mut().zip(bytes.chunks(32)) {
        *slot = U256::from_be_slice(chunk);
    }
    Ok(out)
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct BlsPublicKey {
    pub x: U256,
    pub y: U256,
}

impl BlsPublicKey {
    pub fn from_hex(raw: &str) -> Result<Self, HexWordsError> {
        let [x, y] = hex_words::<2>(raw)?;
        Ok(Self { x, y })
    }

    pub fn to_point(&self) -> G1Point {
        G1Point {
            x: self.x,
            y: self.y,
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct BlsSignature(pub [U256; 4]);

impl BlsSignature {
    pub fn from_hex(raw: &str) -> Result<Self, HexWordsError> {
        Ok(Self(hex_words::<4>(raw)?))
    }

    pub fn to_params(&self) -> BLSSignatureParams {
        let [sigs0, sigs1, sigs2, sigs3] = self.0;
        BLSSignatureParams {
            sigs0,
            sigs1,
            sigs2,
            sigs3,
        }
    }
}
