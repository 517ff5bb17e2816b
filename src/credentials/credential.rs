//! Declarative credential references.

use std::fmt;

use zeroize::ZeroizeOnDrop;

/// Provider id used for literal values declared inline in configuration.
pub const LITERAL_PROVIDER: &str = "literal";

/// A named credential reference, as declared in service configuration.
///
/// `from` names the provider, `get` is the provider-specific lookup key.
/// A literal value is modeled as `from = "literal"` with the value in `get`,
/// so `get` is treated as sensitive.
#[derive(Clone, PartialEq, Eq, ZeroizeOnDrop)]
pub struct Credential {
    /// Name the connector uses to look the value up
    #[zeroize(skip)]
    pub name: String,
    /// Provider id
    #[zeroize(skip)]
    pub from: String,
    /// Provider-specific lookup key (zeroized on drop)
    pub get: String,
}

impl Credential {
    /// Create a credential reference.
    pub fn new(name: impl Into<String>, from: impl Into<String>, get: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            from: from.into(),
            get: get.into(),
        }
    }

    /// Create a credential whose value is given inline.
    pub fn literal(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self::new(name, LITERAL_PROVIDER, value)
    }

    /// Whether the value is declared inline.
    pub fn is_literal(&self) -> bool {
        self.from == LITERAL_PROVIDER
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let get: &str = if self.is_literal() {
            "[REDACTED]"
        } else {
            &self.get
        };
        f.debug_struct("Credential")
            .field("name", &self.name)
            .field("from", &self.from)
            .field("get", &get)
            .finish()
    }
}
