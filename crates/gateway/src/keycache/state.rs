//! Key cache entry states.

/// State of a [`KeyEntry`](super::KeyEntry).
///
/// - `Warm`: the plaintext key and the DEK are both usable; signing may
///   proceed directly.
/// - `Cool`: the plaintext slot has been zeroed but the DEK is still valid;
///   a local rehydration can restore the entry.
/// - `Invalid`: neither the plaintext nor the DEK is usable; only an
///   out-of-band unlock can recover the key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KeyState {
    Warm,
    Cool,
    Invalid,
}

impl KeyState {
    /// Stable label used in metrics and logs.
    pub fn as_str(self) -> &'static str {
        match self {
            KeyState::Warm => "WARM",
            KeyState::Cool => "COOL",
            KeyState::Invalid => "INVALID",
        }
    }
}

impl std::fmt::Display for KeyState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
