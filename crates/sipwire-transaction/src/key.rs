// sipwire - a SIP signaling core in Rust
// SPDX-License-Identifier: Apache-2.0 OR MIT

use std::fmt;

use sha1::{Digest, Sha1};
use sipwire_core::Method;
use smol_str::SmolStr;

/// Transaction identifier: lowercase hex SHA-1 of `branch ‖ method`.
///
/// The branch alone is not enough — a CANCEL shares its branch with the
/// INVITE it cancels, so the method disambiguates. The key is a pure
/// function of its two inputs.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TransactionKey(SmolStr);

impl TransactionKey {
    /// Computes the key for a branch and method.
    pub fn new(branch: &str, method: &Method) -> Self {
        let mut hasher = Sha1::new();
        hasher.update(branch.as_bytes());
        hasher.update(method.as_str().as_bytes());
        let digest = hasher.finalize();

        let mut hex = String::with_capacity(digest.len() * 2);
        for byte in digest {
            use std::fmt::Write;
            let _ = write!(hex, "{:02x}", byte);
        }
        Self(SmolStr::new(hex))
    }

    /// Returns the hex digest text.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TransactionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
