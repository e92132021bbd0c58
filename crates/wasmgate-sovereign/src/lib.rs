// Copyright [2026] [Joseph Verdicchio]
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.
//
// Copyright (c) 2026 Joseph Verdicchio and EvidenceOS Contributors
// SPDX-License-Identifier: Apache-2.0

//! wasmgate-sovereign
//!
//! Signed-artifact handling for the wasmgate platform. An artifact is a
//! wasm binary with an optional detached trailer:
//!
//! `[ bytecode ][ 64-byte ed25519 signature over bytecode ][ 5-byte magic ]`
//!
//! The magic footer marks the file as signed by this system; a runtime that
//! knows nothing about wasmgate can still execute the bytecode prefix of an
//! unsigned copy. Verification strips the trailer and hands back the clean
//! body.

#![forbid(unsafe_code)]
#![deny(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
#![cfg_attr(test, allow(clippy::unwrap_used, clippy::expect_used, clippy::panic))]

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use ed25519_dalek::{Signature, Signer, SigningKey, VerifyingKey};
use thiserror::Error;

/// Trailer marker: `GJSIG`.
pub const SIGNATURE_MAGIC: [u8; 5] = [0x47, 0x4A, 0x53, 0x49, 0x47];

pub const SIGNATURE_LEN: usize = 64;

/// Smallest byte length a signed artifact can have: an empty body still
/// carries the 64-byte signature and the 5-byte magic.
pub const MIN_SIGNED_LEN: usize = SIGNATURE_LEN + SIGNATURE_MAGIC.len();

pub type TrustResult<T> = Result<T, TrustError>;

#[derive(Debug, Error)]
pub enum TrustError {
    #[error("artifact carries no signature trailer")]
    SignatureMissing,

    #[error("artifact signature does not verify under any trusted key")]
    SignatureInvalid,

    #[error("trusted key entry is not a valid ed25519 public key")]
    UntrustedKey,

    #[error("security policy is strict but no trusted keys are configured")]
    TrustMisconfigured,

    #[error("failed to read artifact: {0}")]
    Io(#[from] std::io::Error),
}

/// Loader posture for unsigned or unverifiable artifacts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SecurityPolicy {
    /// Reject anything that does not verify.
    Strict,
    /// Allow, but emit a warning event.
    #[default]
    Audit,
}

impl FromStr for SecurityPolicy {
    type Err = TrustError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw {
            "strict" => Ok(Self::Strict),
            "audit" => Ok(Self::Audit),
            _ => Err(TrustError::TrustMisconfigured),
        }
    }
}

impl fmt::Display for SecurityPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Strict => f.write_str("strict"),
            Self::Audit => f.write_str("audit"),
        }
    }
}

/// Appends the signature trailer to `body`.
pub fn sign(body: &[u8], key: &SigningKey) -> Vec<u8> {
    let signature = key.sign(body);
    let mut out = Vec::with_capacity(body.len() + MIN_SIGNED_LEN);
    out.extend_from_slice(body);
    out.extend_from_slice(&signature.to_bytes());
    out.extend_from_slice(&SIGNATURE_MAGIC);
    out
}

/// Returns true when `bytes` ends with the signature magic.
pub fn has_trailer(bytes: &[u8]) -> bool {
    bytes.len() >= MIN_SIGNED_LEN && bytes[bytes.len() - SIGNATURE_MAGIC.len()..] == SIGNATURE_MAGIC
}

/// Best-effort trailer removal: returns the body when the magic is present,
/// the input unchanged otherwise.
pub fn strip(bytes: &[u8]) -> &[u8] {
    if has_trailer(bytes) {
        &bytes[..bytes.len() - MIN_SIGNED_LEN]
    } else {
        bytes
    }
}

/// Verifies the trailer against `trusted` and returns the clean body.
///
/// The signature is accepted on the first key that verifies; an artifact
/// that verifies under none of them fails with `SignatureInvalid`.
pub fn verify<'a>(bytes: &'a [u8], trusted: &[VerifyingKey]) -> TrustResult<&'a [u8]> {
    if !has_trailer(bytes) {
        return Err(TrustError::SignatureMissing);
    }
    let body_end = bytes.len() - MIN_SIGNED_LEN;
    let body = &bytes[..body_end];
    let sig_bytes: [u8; SIGNATURE_LEN] = bytes[body_end..body_end + SIGNATURE_LEN]
        .try_into()
        .map_err(|_| TrustError::SignatureInvalid)?;
    let signature = Signature::from_bytes(&sig_bytes);

    for key in trusted {
        if key.verify_strict(body, &signature).is_ok() {
            return Ok(body);
        }
    }
    Err(TrustError::SignatureInvalid)
}

/// Parses a hex-encoded ed25519 public key.
pub fn parse_public_key_hex(raw: &str) -> TrustResult<VerifyingKey> {
    let bytes = hex::decode(raw.trim()).map_err(|_| TrustError::UntrustedKey)?;
    let arr: [u8; 32] = bytes.as_slice().try_into().map_err(|_| TrustError::UntrustedKey)?;
    VerifyingKey::from_bytes(&arr).map_err(|_| TrustError::UntrustedKey)
}

/// Parses a hex-encoded ed25519 signing key (32-byte seed or the 64-byte
/// seed+public concatenation the key generator writes).
pub fn parse_signing_key_hex(raw: &str) -> TrustResult<SigningKey> {
    let bytes = hex::decode(raw.trim()).map_err(|_| TrustError::UntrustedKey)?;
    match bytes.len() {
        32 => {
            let arr: [u8; 32] = bytes.as_slice().try_into().map_err(|_| TrustError::UntrustedKey)?;
            Ok(SigningKey::from_bytes(&arr))
        }
        64 => {
            let arr: [u8; 32] = bytes[..32].try_into().map_err(|_| TrustError::UntrustedKey)?;
            Ok(SigningKey::from_bytes(&arr))
        }
        _ => Err(TrustError::UntrustedKey),
    }
}

/// Generates a fresh keypair, returned as (signing, verifying) hex strings.
pub fn generate_keypair_hex() -> (String, String) {
    let signing = SigningKey::generate(&mut rand::rngs::OsRng);
    let verifying = signing.verifying_key();
    (hex::encode(signing.to_bytes()), hex::encode(verifying.to_bytes()))
}

/// Writes `<prefix>.priv` / `<prefix>.pub` hex key files and returns their
/// paths. Key files are owner-readable only.
pub fn write_keypair_files(prefix: &Path) -> TrustResult<(PathBuf, PathBuf)> {
    let (signing_hex, verifying_hex) = generate_keypair_hex();
    let priv_path = PathBuf::from(format!("{}.priv", prefix.display()));
    let pub_path = PathBuf::from(format!("{}.pub", prefix.display()));
    std::fs::write(&priv_path, &signing_hex)?;
    std::fs::write(&pub_path, &verifying_hex)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        for path in [&priv_path, &pub_path] {
            let mut perms = std::fs::metadata(path)?.permissions();
            perms.set_mode(0o600);
            std::fs::set_permissions(path, perms)?;
        }
    }
    Ok((priv_path, pub_path))
}

pub fn read_signing_key_file(path: &Path) -> TrustResult<SigningKey> {
    let raw = std::fs::read_to_string(path)?;
    parse_signing_key_hex(&raw)
}

pub fn read_public_key_file(path: &Path) -> TrustResult<VerifyingKey> {
    let raw = std::fs::read_to_string(path)?;
    parse_public_key_hex(&raw)
}

/// Policy-gated artifact loader.
///
/// Owns the trusted key set for the process lifetime. `load` reads the file
/// and applies the policy algorithm: strict deployments refuse to run
/// without keys or without a verifying signature; audit deployments run the
/// stripped body and emit a warning event instead.
#[derive(Debug, Clone)]
pub struct ModuleLoader {
    keys: Vec<VerifyingKey>,
    policy: SecurityPolicy,
}

impl ModuleLoader {
    pub fn from_hex_keys(hex_keys: &[String], policy: SecurityPolicy) -> TrustResult<Self> {
        let mut keys = Vec::with_capacity(hex_keys.len());
        for raw in hex_keys {
            keys.push(parse_public_key_hex(raw)?);
        }
        Ok(Self { keys, policy })
    }

    pub fn new(keys: Vec<VerifyingKey>, policy: SecurityPolicy) -> Self {
        Self { keys, policy }
    }

    pub fn policy(&self) -> SecurityPolicy {
        self.policy
    }

    pub fn load(&self, path: &Path) -> TrustResult<Vec<u8>> {
        let raw = std::fs::read(path)?;
        self.admit(path, &raw)
    }

    /// Applies the policy to in-memory artifact bytes.
    pub fn admit(&self, path: &Path, raw: &[u8]) -> TrustResult<Vec<u8>> {
        if self.keys.is_empty() {
            return match self.policy {
                SecurityPolicy::Strict => Err(TrustError::TrustMisconfigured),
                SecurityPolicy::Audit => {
                    if has_trailer(raw) {
                        tracing::warn!(
                            artifact = %path.display(),
                            "audit policy: signed artifact admitted without verification (no trusted keys)"
                        );
                    }
                    Ok(strip(raw).to_vec())
                }
            };
        }

        match verify(raw, &self.keys) {
            Ok(body) => {
                tracing::info!(
                    artifact = %path.display(),
                    clean_len = body.len(),
                    "module signature verified"
                );
                Ok(body.to_vec())
            }
            Err(err) => match self.policy {
                SecurityPolicy::Strict => {
                    tracing::error!(
                        artifact = %path.display(),
                        error = %err,
                        "blocking unverified module"
                    );
                    Err(err)
                }
                SecurityPolicy::Audit => {
                    tracing::warn!(
                        artifact = %path.display(),
                        error = %err,
                        "security audit failed, admitting under audit policy"
                    );
                    Ok(strip(raw).to_vec())
                }
            },
        }
    }
}
