//! Process-wide constants. Read-only; compiled regexes are initialized once on first use.

use once_cell::sync::Lazy;
use regex::Regex;

/// File basenames of a snapshot start with this prefix.
pub const SNAPSHOT_FILE_PREFIX: &str = "SNAPSHOT";

/// File basenames of a delta start with this prefix.
pub const DELTA_FILE_PREFIX: &str = "DELTA";

/// Joins the components of a file basename.
pub const FILE_COMPONENT_DELIMITER: char = '_';

/// Number of digits of the logical time in a file basename.
pub const LOGICAL_TIME_DIGITS: usize = 16;

/// Largest logical time that still renders in `LOGICAL_TIME_DIGITS` digits.
pub const MAX_LOGICAL_TIMESTAMP: u64 = 9_999_999_999_999_999;

/// Separator used to split `string_set` values unless configured otherwise.
pub const DEFAULT_VALUE_SEPARATOR: char = ',';

/// Delimiter for multi-key query arguments (`keys=key1,key2`).
pub const QUERY_ARG_DELIMITER: char = ',';

pub const SERVICE_NAME: &str = "kv-server";

/// `<KIND>_<16 digits>`; the kind is validated separately so that an
/// unrecognized kind can be told apart from a malformed name.
pub static FILE_NAME_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(?P<kind>.+)_(?P<ts>[0-9]{16})$").expect("file name regex compiles")
});

/// Oblivious HTTP parameters for the encrypted query path.
pub mod ohttp {
    /// X25519 public key used to test/debug/demo oblivious queries.
    pub const TEST_PUBLIC_KEY: &str =
        "31e1f05a740102115220e9af918f738674aec95f54db6e04eb705aae8e798155";
    /// DHKEM(X25519, HKDF-SHA256)
    pub const KEM: u16 = 0x0020;
    /// HKDF-SHA256
    pub const KDF: u16 = 0x0001;
    /// AES-128-GCM
    pub const AEAD: u16 = 0x0001;
}
