//! Secret byte buffers and the per-connection credential set.

use std::collections::HashMap;
use std::fmt;
use std::ops::Deref;

use zeroize::{Zeroize, ZeroizeOnDrop};

/// An owned secret value.
///
/// The buffer is overwritten with zeros when dropped. [`SecretBytes::wipe`]
/// zeroes it in place without releasing it, which keeps the length so that
/// the wipe can be observed.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct SecretBytes(Vec<u8>);

impl SecretBytes {
    /// Take ownership of `bytes` without copying them.
    pub fn new(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }

    /// Copy `bytes` into a new secret buffer.
    pub fn copy_from(bytes: &[u8]) -> Self {
        Self(bytes.to_vec())
    }

    /// Borrow the secret bytes.
    pub fn expose(&self) -> &[u8] {
        &self.0
    }

    /// Borrow the secret as UTF-8, if it is valid UTF-8.
    pub fn as_str(&self) -> Option<&str> {
        std::str::from_utf8(&self.0).ok()
    }

    /// Length in bytes.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether the secret is empty.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Overwrite every byte with zero, keeping the buffer and its length.
    pub fn wipe(&mut self) {
        self.0.as_mut_slice().zeroize();
    }

    /// True if every byte is zero.
    pub fn is_wiped(&self) -> bool {
        self.0.iter().all(|b| *b == 0)
    }
}

impl From<String> for SecretBytes {
    fn from(value: String) -> Self {
        Self(value.into_bytes())
    }
}

impl From<&str> for SecretBytes {
    fn from(value: &str) -> Self {
        Self(value.as_bytes().to_vec())
    }
}

impl From<Vec<u8>> for SecretBytes {
    fn from(value: Vec<u8>) -> Self {
        Self(value)
    }
}

impl fmt::Debug for SecretBytes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SecretBytes([REDACTED; {} bytes])", self.0.len())
    }
}

/// The resolved credentials for one client connection, keyed by credential name.
///
/// Created fresh per connection and destroyed as soon as the connector has
/// consumed it. Every value is zeroized when the set is dropped.
#[derive(Default)]
pub struct ResolvedCredentials {
    values: HashMap<String, SecretBytes>,
}

impl ResolvedCredentials {
    /// Create an empty set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a value. A replaced value is zeroized.
    pub fn insert(&mut self, name: impl Into<String>, value: SecretBytes) {
        self.values.insert(name.into(), value);
    }

    /// Look up a value by credential name.
    pub fn get(&self, name: &str) -> Option<&SecretBytes> {
        self.values.get(name)
    }

    /// Look up a value as UTF-8. Returns `None` if missing or not UTF-8.
    pub fn get_str(&self, name: &str) -> Option<&str> {
        self.values.get(name).and_then(SecretBytes::as_str)
    }

    /// Whether a credential with this name was resolved.
    pub fn contains(&self, name: &str) -> bool {
        self.values.contains_key(name)
    }

    /// Names of all resolved credentials.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.values.keys().map(String::as_str)
    }

    /// Number of resolved credentials.
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// Whether no credential was resolved.
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Zero every value in place.
    pub fn wipe(&mut self) {
        for value in self.values.values_mut() {
            value.wipe();
        }
    }

    /// True if every byte of every value is zero.
    pub fn is_wiped(&self) -> bool {
        self.values.values().all(SecretBytes::is_wiped)
    }
}

impl FromIterator<(String, SecretBytes)> for ResolvedCredentials {
    fn from_iter<I: IntoIterator<Item = (String, SecretBytes)>>(iter: I) -> Self {
        Self {
            values: iter.into_iter().collect(),
        }
    }
}

impl fmt::Debug for ResolvedCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<&str> = self.names().collect();
        names.sort_unstable();
        f.debug_struct("ResolvedCredentials")
            .field("names", &names)
            .field("values", &"[REDACTED]")
            .finish()
    }
}

/// Wipes the borrowed credential set when dropped.
///
/// Holding one of these across a connector call guarantees the set is
/// zeroed on every exit path, including a panic unwinding through the call.
pub struct WipeGuard<'a> {
    credentials: &'a mut ResolvedCredentials,
}

impl<'a> WipeGuard<'a> {
    /// Guard `credentials` until the returned value is dropped.
    pub fn new(credentials: &'a mut ResolvedCredentials) -> Self {
        Self { credentials }
    }
}

impl Deref for WipeGuard<'_> {
    type Target = ResolvedCredentials;

    fn deref(&self) -> &Self::Target {
        self.credentials
    }
}

impl Drop for WipeGuard<'_> {
    fn drop(&mut self) {
        self.credentials.wipe();
    }
}
