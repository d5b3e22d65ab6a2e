//! Typed identifiers and derived keys.

use sha2::{Digest, Sha224};

use crate::define_id;
use crate::IdError;

// =============================================================================
// ULID-backed IDs
// =============================================================================

define_id!(ObjectUid, "uid");
define_id!(RequestId, "req");

// =============================================================================
// Digests
// =============================================================================

const BASE62: &[u8] = b"0123456789ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz";
const BASE36: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";

/// SHA-224 of `input`, rendered in base62.
pub fn digest_base62(input: &[u8]) -> String {
    encode_big_endian(&Sha224::digest(input), BASE62)
}

/// SHA-224 of `input`, rendered in lowercase base36 (DNS-label safe).
pub fn digest_base36(input: &[u8]) -> String {
    encode_big_endian(&Sha224::digest(input), BASE36)
}

/// Encodes a big-endian unsigned integer in the given alphabet.
fn encode_big_endian(bytes: &[u8], alphabet: &[u8]) -> String {
    let radix = alphabet.len() as u32;
    let mut number: Vec<u8> = bytes.iter().copied().skip_while(|b| *b == 0).collect();
    let mut digits = Vec::new();

    while !number.is_empty() {
        let mut remainder = 0u32;
        let mut quotient = Vec::with_capacity(number.len());
        for byte in &number {
            let acc = (remainder << 8) | u32::from(*byte);
            let q = acc / radix;
            remainder = acc % radix;
            if !(quotient.is_empty() && q == 0) {
                quotient.push(q as u8);
            }
        }
        digits.push(alphabet[remainder as usize]);
        number = quotient;
    }

    if digits.is_empty() {
        digits.push(alphabet[0]);
    }
    digits.reverse();
    String::from_utf8(digits).unwrap_or_default()
}

// =============================================================================
// Target Key
// =============================================================================

/// Stable key identifying an execution target inside label keys.
///
/// Derived from the workspace the target is registered in and its name, so a
/// target that deregisters and registers again keeps its key and therefore
/// its sync-intent labels.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TargetKey(String);

impl TargetKey {
    /// Derive the key for a target named `name` in `workspace`.
    pub fn derive(workspace: &str, name: &str) -> Self {
        let mut input = Vec::with_capacity(workspace.len() + name.len());
        input.extend_from_slice(workspace.as_bytes());
        input.extend_from_slice(name.as_bytes());
        Self(digest_base62(&input))
    }

    /// Wrap an already-derived key, e.g. one read back from a label.
    pub fn parse(s: &str) -> Result<Self, IdError> {
        if s.is_empty() {
            return Err(IdError::Empty);
        }
        if !s.bytes().all(|b| b.is_ascii_alphanumeric()) {
            return Err(IdError::InvalidName {
                name: s.to_string(),
                message: "target keys are base62".to_string(),
            });
        }
        Ok(Self(s.to_string()))
    }

    /// The key as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for TargetKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl serde::Serialize for TargetKey {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.0)
    }
}

impl<'de> serde::Deserialize<'de> for TargetKey {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Self::parse(&s).map_err(serde::de::Error::custom)
    }
}

// =============================================================================
// Workspace Name
// =============================================================================

/// A logical workspace path such as `root:acme:payments`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct WorkspaceName(String);

impl WorkspaceName {
    /// Parse and validate a workspace path.
    ///
    /// Each `:`-separated segment must be a lowercase DNS label
    /// (`[a-z0-9]([-a-z0-9]*[a-z0-9])?`, at most 63 characters).
    pub fn parse(s: &str) -> Result<Self, IdError> {
        if s.is_empty() {
            return Err(IdError::Empty);
        }
        for segment in s.split(':') {
            validate_dns_label(segment).map_err(|message| IdError::InvalidName {
                name: s.to_string(),
                message,
            })?;
        }
        Ok(Self(s.to_string()))
    }

    /// The workspace path as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The parent workspace, if any.
    pub fn parent(&self) -> Option<WorkspaceName> {
        self.0
            .rsplit_once(':')
            .map(|(parent, _)| WorkspaceName(parent.to_string()))
    }
}

impl std::fmt::Display for WorkspaceName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::str::FromStr for WorkspaceName {
    type Err = IdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

/// Validate a lowercase DNS label.
pub fn validate_dns_label(label: &str) -> Result<(), String> {
    if label.is_empty() {
        return Err("empty segment".to_string());
    }
    if label.len() > 63 {
        return Err(format!("segment '{label}' longer than 63 characters"));
    }
    let bytes = label.as_bytes();
    let valid_char = |b: &u8| b.is_ascii_lowercase() || b.is_ascii_digit() || *b == b'-';
    if !bytes.iter().all(valid_char) {
        return Err(format!("segment '{label}' must be lowercase alphanumeric or '-'"));
    }
    if bytes[0] == b'-' || bytes[bytes.len() - 1] == b'-' {
        return Err(format!("segment '{label}' must start and end alphanumeric"));
    }
    Ok(())
}
