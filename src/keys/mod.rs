//! Key material and the offline file formats the connection layer needs:
//! the `openssh-key-v1` private-key container and the `known_hosts`
//! host-key database. Parse failures here never cross into the live
//! protocol path; they stay with the caller doing the bootstrap.

use data_encoding::BASE64;
use ed25519_dalek::{SigningKey, VerifyingKey};
use ssh_encoding::{Decode, Encode, Writer};
use thiserror::Error;

pub mod known_hosts;
pub mod openssh;

pub use known_hosts::{verify_host, verify_host_path, Verification};
pub use openssh::{decode_secret_keys, load_secret_keys};

pub const SSH_ED25519: &str = "ssh-ed25519";
pub const SSH_RSA: &str = "ssh-rsa";

#[derive(Debug, Error)]
pub enum Error {
    /// The key could not be read, for an unknown reason.
    #[error("Could not read key")]
    CouldNotReadKey,
    /// The key uses an algorithm this crate does not carry.
    #[error("Unsupported key algorithm: {0}")]
    UnsupportedKeyAlgorithm(String),
    /// The key file is protected by a cipher this crate does not carry.
    #[error("Unsupported cipher: {0}")]
    UnsupportedCipher(String),
    /// The key file uses an unknown key-derivation function.
    #[error("Unsupported KDF: {0}")]
    UnsupportedKdf(String),
    /// The key is encrypted (should supply a passphrase?).
    #[error("The key is encrypted")]
    KeyIsEncrypted,
    /// The check values after decryption disagree.
    #[error("Wrong passphrase")]
    WrongPassphrase,
    /// The key contents are inconsistent.
    #[error("The key is corrupt")]
    KeyIsCorrupt,
    /// Home directory could not be found.
    #[error("No home directory found")]
    NoHomeDir,
    #[error("Invalid Ed25519 key data")]
    Ed25519(#[from] ed25519_dalek::SignatureError),
    #[error("Base64 decoding error: {0}")]
    Decode(#[from] data_encoding::DecodeError),
    #[error(transparent)]
    SshEncoding(#[from] ssh_encoding::Error),
    #[error(transparent)]
    IO(#[from] std::io::Error),
}

/// A public key with its canonical SSH wire form.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PublicKey {
    Ed25519(VerifyingKey),
    Rsa {
        /// Minimal big-endian magnitude of n.
        modulus: Vec<u8>,
        /// Minimal big-endian magnitude of e.
        exponent: Vec<u8>,
    },
    /// A key of an algorithm this crate does not interpret; kept only so
    /// databases mentioning it can be skipped, never matched.
    Other(String),
}

impl PublicKey {
    /// Algorithm name for that key.
    pub fn algorithm(&self) -> &str {
        match self {
            PublicKey::Ed25519(_) => SSH_ED25519,
            PublicKey::Rsa { .. } => SSH_RSA,
            PublicKey::Other(name) => name.as_str(),
        }
    }

    /// Parse a public key from its SSH wire blob.
    pub fn parse_wire(blob: &[u8]) -> Result<PublicKey, Error> {
        let mut r = blob;
        let algorithm = String::decode(&mut r)?;
        match algorithm.as_str() {
            SSH_ED25519 => {
                let bytes = Vec::<u8>::decode(&mut r)?;
                let bytes: [u8; 32] = bytes.try_into().map_err(|_| Error::CouldNotReadKey)?;
                Ok(PublicKey::Ed25519(VerifyingKey::from_bytes(&bytes)?))
            }
            SSH_RSA => {
                // https://tools.ietf.org/html/rfc4253#section-6.6: e, then n.
                let exponent = strip_leading_zeros(Vec::<u8>::decode(&mut r)?);
                let modulus = strip_leading_zeros(Vec::<u8>::decode(&mut r)?);
                Ok(PublicKey::Rsa { modulus, exponent })
            }
            _ => Ok(PublicKey::Other(algorithm)),
        }
    }

    /// The canonical SSH wire blob: algorithm name followed by the
    /// algorithm-specific fields.
    pub fn to_wire(&self) -> Result<Vec<u8>, Error> {
        let mut out = Vec::new();
        match self {
            PublicKey::Ed25519(key) => {
                SSH_ED25519.encode(&mut out)?;
                key.as_bytes().as_slice().encode(&mut out)?;
            }
            PublicKey::Rsa { modulus, exponent } => {
                SSH_RSA.encode(&mut out)?;
                encode_mpint(exponent, &mut out)?;
                encode_mpint(modulus, &mut out)?;
            }
            PublicKey::Other(name) => {
                return Err(Error::UnsupportedKeyAlgorithm(name.clone()));
            }
        }
        Ok(out)
    }

    /// Compute the key fingerprint, hashed with sha2-256.
    pub fn fingerprint(&self) -> Result<String, Error> {
        use sha2::{Digest, Sha256};
        let mut hasher = Sha256::new();
        hasher.update(self.to_wire()?);
        Ok(data_encoding::BASE64_NOPAD.encode(&hasher.finalize()))
    }
}

/// A key pair usable as a host or client identity. Secret material lives
/// in storage that is scrubbed on drop.
#[derive(Clone)]
pub enum KeyPair {
    Ed25519 {
        public: VerifyingKey,
        secret: SigningKey,
    },
}

impl KeyPair {
    pub fn from_ed25519_seed(seed: &[u8; 32]) -> KeyPair {
        let secret = SigningKey::from_bytes(seed);
        KeyPair::Ed25519 {
            public: secret.verifying_key(),
            secret,
        }
    }

    /// Name of this key algorithm.
    pub fn algorithm(&self) -> &str {
        match self {
            KeyPair::Ed25519 { .. } => SSH_ED25519,
        }
    }

    /// Copy the public key of this pair.
    pub fn clone_public_key(&self) -> PublicKey {
        match self {
            KeyPair::Ed25519 { public, .. } => PublicKey::Ed25519(*public),
        }
    }
}

impl std::fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            KeyPair::Ed25519 { public, .. } => write!(
                f,
                "Ed25519 {{ public: {:?}, secret: (hidden) }}",
                public.as_bytes()
            ),
        }
    }
}

/// Reads a public key from the standard encoding. In some cases, the
/// encoding is prefixed with a key type identifier and a space (such as
/// `ssh-ed25519 AAAAC3N...`); strip that before calling.
pub fn parse_public_key_base64(key: &str) -> Result<PublicKey, Error> {
    let blob = base64_decode(key)?;
    PublicKey::parse_wire(&blob)
}

/// Base64 with exact `=`/`==` padding, tolerant of interleaved
/// whitespace.
pub(crate) fn base64_decode(text: &str) -> Result<Vec<u8>, Error> {
    let cleaned: Vec<u8> = text
        .bytes()
        .filter(|b| !b.is_ascii_whitespace())
        .collect();
    Ok(BASE64.decode(&cleaned)?)
}

fn strip_leading_zeros(mut bytes: Vec<u8>) -> Vec<u8> {
    let nonzero = bytes.iter().position(|b| *b != 0).unwrap_or(bytes.len());
    bytes.drain(..nonzero);
    bytes
}

/// Encoding length rules of RFC 4251 mpints: minimal magnitude, one
/// leading zero byte when the high bit is set.
fn encode_mpint(magnitude: &[u8], w: &mut impl Writer) -> Result<(), ssh_encoding::Error> {
    let nonzero = magnitude
        .iter()
        .position(|b| *b != 0)
        .unwrap_or(magnitude.len());
    let stripped = magnitude.get(nonzero..).unwrap_or_default();
    let padded = stripped.first().is_some_and(|b| b & 0x80 != 0);
    let len = stripped.len() + usize::from(padded);
    (len as u32).encode(w)?;
    if padded {
        w.write(&[0])?;
    }
    w.write(stripped)
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)] // Allow unwraps, expects and panics in the test suite

    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    use super::*;

    #[test]
    fn base64_roundtrip_survives_whitespace() {
        let mut rng = StdRng::seed_from_u64(0xb64);
        for _ in 0..100 {
            let data: Vec<u8> = (0..rng.gen_range(0..200)).map(|_| rng.gen()).collect();
            let encoded = BASE64.encode(&data);
            assert_eq!(base64_decode(&encoded).unwrap(), data);

            // Sprinkle whitespace at random positions; decode is unchanged.
            let mut noisy = String::new();
            for c in encoded.chars() {
                if rng.gen_bool(0.2) {
                    noisy.push(['\n', '\r', ' ', '\t'][rng.gen_range(0..4)]);
                }
                noisy.push(c);
            }
            assert_eq!(base64_decode(&noisy).unwrap(), data);
        }
    }

    #[test]
    fn base64_padding_is_strict() {
        assert!(base64_decode("AAA").is_err());
        assert!(base64_decode("AAA==").is_err());
        assert!(base64_decode("AA==").is_ok());
    }

    #[test]
    fn ed25519_wire_roundtrip() {
        let pair = KeyPair::from_ed25519_seed(&[7u8; 32]);
        let public = pair.clone_public_key();
        let blob = public.to_wire().unwrap();
        assert_eq!(PublicKey::parse_wire(&blob).unwrap(), public);
        assert_eq!(public.algorithm(), SSH_ED25519);
    }

    #[test]
    fn rsa_wire_roundtrip_normalizes_mpints() {
        let key = PublicKey::Rsa {
            modulus: vec![0x81, 0x02, 0x03],
            exponent: vec![1, 0, 1],
        };
        let blob = key.to_wire().unwrap();
        // The high bit of the modulus forces a leading zero on the wire.
        let parsed = PublicKey::parse_wire(&blob).unwrap();
        assert_eq!(parsed, key);
    }

    #[test]
    fn unknown_algorithm_is_carried_but_not_encoded() {
        let mut blob = Vec::new();
        "ecdsa-sha2-nistp256".encode(&mut blob).unwrap();
        let parsed = PublicKey::parse_wire(&blob).unwrap();
        assert_eq!(parsed, PublicKey::Other("ecdsa-sha2-nistp256".into()));
        assert!(parsed.to_wire().is_err());
    }
}
