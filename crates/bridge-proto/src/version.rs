//! Protocol version table
//!
//! Index 0 is the legacy hash-only handshake; every later index speaks the
//! timestamp + HMAC handshake.

/// Core version reported by this server
pub const VERSION: &str = "0.27.0";

/// Minimum versions an agent may declare, oldest first
pub const MIN_VERSIONS: &[&str] = &["0.26.0", "0.27.0"];

/// Index of the newest protocol version
pub fn latest_index() -> usize {
    MIN_VERSIONS.len().saturating_sub(1)
}

/// Newest minimum version string
pub fn latest() -> &'static str {
    MIN_VERSIONS.last().copied().unwrap_or("")
}

/// Version string at `index`, falling back to the newest one
pub fn version_at(index: usize) -> &'static str {
    MIN_VERSIONS.get(index).copied().unwrap_or_else(latest)
}

/// Position of `declared` in the table
pub fn index_of(declared: &str) -> Option<usize> {
    MIN_VERSIONS.iter().position(|v| *v == declared)
}

/// Resolve the minimum version an agent declared to a protocol index.
///
/// Strict mode only admits the newest version; otherwise any listed
/// version is accepted. Unknown strings never resolve.
pub fn resolve(declared: &str, secure_mode: bool) -> Option<usize> {
    let index = if secure_mode {
        latest_index()
    } else {
        index_of(declared)?
    };

    (version_at(index) == declared).then_some(index)
}
