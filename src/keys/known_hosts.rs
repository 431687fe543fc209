//! `known_hosts` database reader and host-key verifier.
//!
//! Each line holds either a comma-separated list of plain host patterns
//! or a hashed `|1|salt|hash` pattern, followed by the key type and the
//! base64 key blob. Comments and lines that do not fit the grammar
//! (including unknown key algorithms) are skipped silently.

use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use data_encoding::BASE64;
use hmac::{Hmac, Mac};
use log::debug;
use sha1::Sha1;

use super::{base64_decode, parse_public_key_base64, Error, PublicKey};
use crate::Address;

/// The verifier's verdict: a value, not an error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verification {
    Passed,
    /// No entry matched; the message names the database consulted.
    Failed(String),
}

/// One database entry: a non-empty pattern list and a key.
pub struct KnownHost {
    patterns: Vec<Pattern>,
    pub key: PublicKey,
}

enum Pattern {
    Plain(String),
    /// OpenSSH `|1|` form: matches when HMAC-SHA1(salt, name) == hash.
    Hashed { salt: Vec<u8>, hash: Vec<u8> },
}

impl KnownHost {
    pub fn matches_name(&self, name: &str) -> bool {
        self.patterns.iter().any(|p| p.matches(name))
    }
}

impl Pattern {
    fn matches(&self, name: &str) -> bool {
        match self {
            Pattern::Plain(pattern) => pattern == name,
            Pattern::Hashed { salt, hash } => {
                if let Ok(hmac) = Hmac::<Sha1>::new_from_slice(salt) {
                    hmac.chain_update(name).verify_slice(hash).is_ok()
                } else {
                    false
                }
            }
        }
    }
}

fn parse_pattern(entry: &str) -> Pattern {
    if let Some(rest) = entry.strip_prefix("|1|") {
        let mut parts = rest.split('|');
        if let (Some(salt), Some(hash)) = (parts.next(), parts.next()) {
            if let (Ok(salt), Ok(hash)) = (base64_decode(salt), base64_decode(hash)) {
                return Pattern::Hashed { salt, hash };
            }
        }
    }
    // A malformed hashed pattern degrades to a plain one that no
    // hostname can equal.
    Pattern::Plain(entry.into())
}

fn parse_line(line: &str) -> Option<KnownHost> {
    let line = line.trim();
    if line.is_empty() || line.starts_with('#') {
        return None;
    }
    let mut fields = line.split_whitespace();
    let patterns = fields.next()?;
    let algorithm = fields.next()?;
    let blob = fields.next()?;
    let key = parse_public_key_base64(blob).ok()?;
    if matches!(key, PublicKey::Other(_)) || key.algorithm() != algorithm {
        return None;
    }
    let patterns: Vec<Pattern> = patterns
        .split(',')
        .filter(|p| !p.is_empty())
        .map(parse_pattern)
        .collect();
    if patterns.is_empty() {
        return None;
    }
    Some(KnownHost { patterns, key })
}

/// Reads every parseable entry of a `known_hosts` file. A missing file
/// reads as empty, like an empty database.
pub fn read_known_hosts_path<P: AsRef<Path>>(path: P) -> Result<Vec<KnownHost>, Error> {
    let path = expand_tilde(path.as_ref())?;
    let file = match File::open(&path) {
        Ok(file) => file,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(err) => return Err(err.into()),
    };
    let mut entries = Vec::new();
    for line in BufReader::new(file).lines() {
        if let Some(entry) = parse_line(&line?) {
            entries.push(entry);
        }
    }
    Ok(entries)
}

/// Verifies `key` for `address` against the database at `path`.
pub fn verify_host_path<P: AsRef<Path>>(
    path: P,
    address: &Address,
    key: &PublicKey,
) -> Result<Verification, Error> {
    let expanded = expand_tilde(path.as_ref())?;
    let name = address.canonical();
    debug!("verifying host key for {name:?}");
    for entry in read_known_hosts_path(&expanded)? {
        if entry.matches_name(&name) && entry.key == *key {
            return Ok(Verification::Passed);
        }
    }
    Ok(Verification::Failed(format!(
        "no matching host key for {} in {}",
        name,
        absolute(&expanded).display()
    )))
}

/// Verifies against the user's standard database.
pub fn verify_host(address: &Address, key: &PublicKey) -> Result<Verification, Error> {
    verify_host_path(default_path()?, address, key)
}

/// Records a host key in canonical form, appending to the database.
pub fn record_known_host<P: AsRef<Path>>(
    path: P,
    address: &Address,
    key: &PublicKey,
) -> Result<(), Error> {
    let path = expand_tilde(path.as_ref())?;
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let mut file = OpenOptions::new()
        .read(true)
        .append(true)
        .create(true)
        .open(path)?;

    // Test whether the file already ends with a newline.
    let mut buf = [0; 1];
    let mut ends_in_newline = true;
    if file.seek(SeekFrom::End(-1)).is_ok() {
        file.read_exact(&mut buf)?;
        ends_in_newline = buf == [b'\n'];
    }

    file.seek(SeekFrom::End(0))?;
    let mut file = std::io::BufWriter::new(file);
    if !ends_in_newline {
        file.write_all(b"\n")?;
    }
    writeln!(
        file,
        "{} {} {}",
        address.canonical(),
        key.algorithm(),
        BASE64.encode(&key.to_wire()?)
    )?;
    Ok(())
}

fn default_path() -> Result<PathBuf, Error> {
    home::home_dir()
        .map(|home| home.join(".ssh").join("known_hosts"))
        .ok_or(Error::NoHomeDir)
}

fn expand_tilde(path: &Path) -> Result<PathBuf, Error> {
    match path.strip_prefix("~") {
        Ok(rest) => home::home_dir()
            .map(|home| home.join(rest))
            .ok_or(Error::NoHomeDir),
        Err(_) => Ok(path.to_path_buf()),
    }
}

fn absolute(path: &Path) -> PathBuf {
    std::fs::canonicalize(path).unwrap_or_else(|_| {
        std::env::current_dir()
            .map(|cwd| cwd.join(path))
            .unwrap_or_else(|_| path.to_path_buf())
    })
}

#[cfg(test)]
mod test {
    #![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)] // Allow unwraps, expects and panics in the test suite

    use std::fs::File;

    use super::*;
    use crate::keys::KeyPair;

    fn sample_key(seed: u8) -> PublicKey {
        KeyPair::from_ed25519_seed(&[seed; 32]).clone_public_key()
    }

    fn key_base64(key: &PublicKey) -> String {
        BASE64.encode(&key.to_wire().unwrap())
    }

    fn hashed_pattern(name: &str, salt: &[u8]) -> String {
        let hash = Hmac::<Sha1>::new_from_slice(salt)
            .unwrap()
            .chain_update(name)
            .finalize()
            .into_bytes();
        format!("|1|{}|{}", BASE64.encode(salt), BASE64.encode(&hash))
    }

    #[test]
    fn plain_entries_verify() {
        env_logger::try_init().unwrap_or(());
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("known_hosts");
        let key = sample_key(1);
        let other = sample_key(2);
        {
            let mut f = File::create(&path).unwrap();
            writeln!(f, "# a comment").unwrap();
            writeln!(f, "this line is not an entry").unwrap();
            writeln!(f, "example.com ssh-ed25519 {}", key_base64(&key)).unwrap();
            writeln!(
                f,
                "alias.example.com,[other.example.com]:2222 ssh-ed25519 {}",
                key_base64(&other)
            )
            .unwrap();
            // An algorithm this crate does not carry is skipped.
            writeln!(f, "weird.example.com ssh-weird AAAA").unwrap();
        }

        let address = Address::new("example.com", 22);
        assert_eq!(
            verify_host_path(&path, &address, &key).unwrap(),
            Verification::Passed
        );
        match verify_host_path(&path, &address, &other).unwrap() {
            Verification::Failed(message) => {
                assert!(message.contains("example.com"), "{message}");
                assert!(message.contains("known_hosts"), "{message}");
            }
            Verification::Passed => panic!("wrong key accepted"),
        }
        assert_eq!(
            verify_host_path(&path, &Address::new("other.example.com", 2222), &other).unwrap(),
            Verification::Passed
        );
        // Same host, standard port: the bracketed pattern must not match.
        assert!(matches!(
            verify_host_path(&path, &Address::new("other.example.com", 22), &other).unwrap(),
            Verification::Failed(_)
        ));
    }

    #[test]
    fn hashed_entries_verify() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("known_hosts");
        let key = sample_key(3);
        let salt = [0x44u8; 20];
        {
            let mut f = File::create(&path).unwrap();
            writeln!(
                f,
                "{} ssh-ed25519 {}",
                hashed_pattern("hashed.example.com", &salt),
                key_base64(&key)
            )
            .unwrap();
        }
        assert_eq!(
            verify_host_path(&path, &Address::new("hashed.example.com", 22), &key).unwrap(),
            Verification::Passed
        );
        assert!(matches!(
            verify_host_path(&path, &Address::new("elsewhere.example.com", 22), &key).unwrap(),
            Verification::Failed(_)
        ));
    }

    #[test]
    fn hashed_pattern_for_nonstandard_port() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("known_hosts");
        let key = sample_key(4);
        let salt = [0x09u8; 20];
        {
            let mut f = File::create(&path).unwrap();
            writeln!(
                f,
                "{} ssh-ed25519 {}",
                hashed_pattern("[hashed.example.com]:2200", &salt),
                key_base64(&key)
            )
            .unwrap();
        }
        assert_eq!(
            verify_host_path(&path, &Address::new("hashed.example.com", 2200), &key).unwrap(),
            Verification::Passed
        );
    }

    #[test]
    fn missing_database_fails_cleanly() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("absent");
        let key = sample_key(5);
        assert!(matches!(
            verify_host_path(&path, &Address::new("example.com", 22), &key).unwrap(),
            Verification::Failed(_)
        ));
    }

    #[test]
    fn crlf_lines_parse() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("known_hosts");
        let key = sample_key(6);
        {
            let mut f = File::create(&path).unwrap();
            write!(f, "example.org ssh-ed25519 {}\r\n", key_base64(&key)).unwrap();
        }
        assert_eq!(
            verify_host_path(&path, &Address::new("example.org", 22), &key).unwrap(),
            Verification::Passed
        );
    }

    #[test]
    fn record_then_verify() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fresh").join("known_hosts");
        let key = sample_key(7);
        let address = Address::new("recorded.example.com", 2201);
        record_known_host(&path, &address, &key).unwrap();
        // Appending to a file that lacks a trailing newline still yields
        // one entry per line.
        {
            let mut f = OpenOptions::new().append(true).open(&path).unwrap();
            write!(f, "tail-without-newline").unwrap();
        }
        let second = Address::new("second.example.com", 22);
        record_known_host(&path, &second, &key).unwrap();
        assert_eq!(
            verify_host_path(&path, &address, &key).unwrap(),
            Verification::Passed
        );
        assert_eq!(
            verify_host_path(&path, &second, &key).unwrap(),
            Verification::Passed
        );
    }
}
