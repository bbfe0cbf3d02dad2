//! Request authentication for the Polymarket CLOB.
//!
//! Two levels:
//!
//! - **L1**: an EIP-712 `ClobAuth` signature from the wallet key. Only used to
//!   derive or create API credentials.
//! - **L2**: an HMAC-SHA256 over `timestamp + METHOD + path + body`, keyed with
//!   the API secret. Used on every account endpoint.
//!
//! ## Security
//!
//! The private key never leaves `WalletSigner`; its `Debug` output is redacted.

use std::str::FromStr;

use alloy::primitives::{Address, U256};
use alloy::signers::SignerSync;
use alloy::signers::local::PrivateKeySigner;
use alloy::sol;
use alloy::sol_types::{SolStruct, eip712_domain};
use base64::engine::general_purpose::{STANDARD, URL_SAFE, URL_SAFE_NO_PAD};
use base64::Engine;
use hmac::{Hmac, Mac};
use sha2::Sha256;

use crate::rest::VenueError;
use crate::types::ApiCreds;

type HmacSha256 = Hmac<Sha256>;

/// Fixed attestation text the venue expects in `ClobAuth`.
pub const CLOB_AUTH_MESSAGE: &str = "This message attests that I control the given wallet";

pub mod headers {
    pub const POLY_ADDRESS: &str = "POLY_ADDRESS";
    pub const POLY_SIGNATURE: &str = "POLY_SIGNATURE";
    pub const POLY_TIMESTAMP: &str = "POLY_TIMESTAMP";
    pub const POLY_NONCE: &str = "POLY_NONCE";
    pub const POLY_API_KEY: &str = "POLY_API_KEY";
    pub const POLY_PASSPHRASE: &str = "POLY_PASSPHRASE";
}

sol! {
    struct ClobAuth {
        address address;
        string timestamp;
        uint256 nonce;
        string message;
    }
}

/// Wallet key used for L1 signatures.
#[derive(Clone)]
pub struct WalletSigner {
    signer: PrivateKeySigner,
    chain_id: u64,
}

impl std::fmt::Debug for WalletSigner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WalletSigner")
            .field("address", &self.signer.address())
            .field("chain_id", &self.chain_id)
            .field("private_key", &"[REDACTED]")
            .finish()
    }
}

impl WalletSigner {
    /// Parse a hex private key (with or without `0x`).
    pub fn from_private_key(private_key_hex: &str, chain_id: u64) -> Result<Self, VenueError> {
        let signer = PrivateKeySigner::from_str(private_key_hex.trim())
            .map_err(|e| VenueError::Auth(format!("Invalid private key: {e}")))?;
        Ok(Self { signer, chain_id })
    }

    pub fn address(&self) -> Address {
        self.signer.address()
    }

    pub fn chain_id(&self) -> u64 {
        self.chain_id
    }

    /// Sign a `ClobAuth` attestation and return the 0x-prefixed signature.
    pub fn sign_clob_auth(&self, timestamp: i64, nonce: u64) -> Result<String, VenueError> {
        let auth = ClobAuth {
            address: self.address(),
            timestamp: timestamp.to_string(),
            nonce: U256::from(nonce),
            message: CLOB_AUTH_MESSAGE.to_string(),
        };
        let domain = eip712_domain! {
            name: "ClobAuthDomain",
            version: "1",
            chain_id: self.chain_id,
        };
        let hash = auth.eip712_signing_hash(&domain);
        let signature = self
            .signer
            .sign_hash_sync(&hash)
            .map_err(|e| VenueError::Auth(format!("L1 signing failed: {e}")))?;
        Ok(format!("0x{}", hex::encode(signature.as_bytes())))
    }

    /// Headers for L1-authenticated requests.
    pub fn l1_headers(&self, timestamp: i64, nonce: u64) -> Result<Vec<(&'static str, String)>, VenueError> {
        let signature = self.sign_clob_auth(timestamp, nonce)?;
        Ok(vec![
            (headers::POLY_ADDRESS, self.address().to_string()),
            (headers::POLY_SIGNATURE, signature),
            (headers::POLY_TIMESTAMP, timestamp.to_string()),
            (headers::POLY_NONCE, nonce.to_string()),
        ])
    }
}

/// Decode an API secret. The venue issues url-safe base64, but older
/// credentials were sometimes stored with the standard alphabet or unpadded.
fn decode_secret(secret: &str) -> Result<Vec<u8>, VenueError> {
    let secret = secret.trim();
    URL_SAFE
        .decode(secret)
        .or_else(|_| URL_SAFE_NO_PAD.decode(secret))
        .or_else(|_| STANDARD.decode(secret))
        .map_err(|e| VenueError::Auth(format!("API secret is not base64: {e}")))
}

/// L2 HMAC signature, url-safe base64 encoded.
pub fn build_hmac_signature(
    secret: &str,
    timestamp: i64,
    method: &str,
    request_path: &str,
    body: Option<&str>,
) -> Result<String, VenueError> {
    let key = decode_secret(secret)?;
    let mut mac = HmacSha256::new_from_slice(&key)
        .map_err(|e| VenueError::Auth(format!("Invalid HMAC key: {e}")))?;
    mac.update(timestamp.to_string().as_bytes());
    mac.update(method.to_ascii_uppercase().as_bytes());
    mac.update(request_path.as_bytes());
    if let Some(body) = body {
        mac.update(body.as_bytes());
    }
    Ok(URL_SAFE.encode(mac.finalize().into_bytes()))
}

/// Headers for L2-authenticated requests.
pub fn l2_headers(
    address: &str,
    creds: &ApiCreds,
    timestamp: i64,
    method: &str,
    request_path: &str,
    body: Option<&str>,
) -> Result<Vec<(&'static str, String)>, VenueError> {
    let signature = build_hmac_signature(&creds.secret, timestamp, method, request_path, body)?;
    Ok(vec![
        (headers::POLY_ADDRESS, address.to_string()),
        (headers::POLY_SIGNATURE, signature),
        (headers::POLY_TIMESTAMP, timestamp.to_string()),
        (headers::POLY_API_KEY, creds.key.clone()),
        (headers::POLY_PASSPHRASE, creds.passphrase.clone()),
    ])
}
