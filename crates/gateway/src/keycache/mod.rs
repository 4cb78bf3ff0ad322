//! Key cache: per-key state machines that keep the hot signing path off the
//! remote KMS.
//!
//! # Lifecycle
//!
//! An entry is constructed warm (with a plaintext key) or cool (ciphertext
//! only) and may cycle `Warm → Cool → Warm` many times through local DEK
//! rehydration. A failed rehydration or an expired DEK makes the entry
//! `Invalid`, which is terminal until the out-of-band unlock path re-seeds
//! it. All refresh work is coalesced per key through the single-flight
//! [`RefreshGroup`]; the [`Prefetcher`] keeps soft-TTL crossings off the
//! request path.

pub mod dek;
pub mod entry;
pub mod metrics;
pub mod prefetch;
pub mod refresh;
pub mod rehydrate;
pub mod state;
pub mod store;
pub mod unlock;

pub use dek::{DekStore, KEY_LEN};
pub use entry::{Checkout, EntryConfig, KeyEntry, PlainKey};
pub use metrics::CacheMetrics;
pub use prefetch::{Prefetcher, PrefetcherConfig};
pub use refresh::{RefreshGroup, RefreshScheduler};
pub use rehydrate::{DekRehydrator, Rehydrator};
pub use state::KeyState;
pub use store::{EntryIterator, KeyStore};
pub use unlock::{NoopNotifier, UnlockEvent, UnlockNotifier, UnlockOutcome};
