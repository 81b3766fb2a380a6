//! Protocol versioning.

use semver::Version;

/// The protocol version spoken by this build, on both sides of the bridge.
pub const PROTOCOL_VERSION: &str = "0.1.0";

/// Returns `true` if two protocol versions can talk to each other.
///
/// Major and minor must be equal; patch may differ. A version that does not
/// parse as `major.minor.patch` is never compatible with anything.
#[must_use]
pub fn compatible(local: &str, remote: &str) -> bool {
    match (Version::parse(local), Version::parse(remote)) {
        (Ok(a), Ok(b)) => a.major == b.major && a.minor == b.minor,
        _ => false,
    }
}
