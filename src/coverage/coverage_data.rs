//! Name encoding for shared-memory regions, and the coverage-data stream item type.
//!
//! Mirrors `original_source/src/sys/fuzzing/realmfuzzer/engine/coverage-data.cc`: a
//! target id is base64-encoded, truncated to drop the padding character, and prefixed
//! onto the module id to form one shared-memory name. `kTargetIdLen` there is
//! `modp_b64_encode_len(8) - 2`, i.e. 10 characters for an 8-byte id with the trailing
//! `=` padding stripped; this crate reproduces that exact length so names decode the
//! same way.

use base64::engine::general_purpose::STANDARD_NO_PAD;
use base64::Engine;

/// Number of base64 characters used to encode an 8-byte target id once padding is
/// stripped (`ceil(8 / 3 * 4) - 2` in the original's accounting == 11 here, since we use
/// the no-pad engine directly rather than stripping a trailing `=`).
pub const TARGET_ID_LEN: usize = 11;

/// Builds the shared-memory name `base64(target_id) || "/" || module_id`.
pub fn encode_name(target_id: u64, module_id: &str) -> String {
    let encoded = STANDARD_NO_PAD.encode(target_id.to_le_bytes());
    debug_assert_eq!(encoded.len(), TARGET_ID_LEN);
    format!("{encoded}/{module_id}")
}

/// Recovers the target id prefix from a shared-memory name, or `None` if the name is too
/// short or not valid base64.
pub fn decode_target_id(name: &str) -> Option<u64> {
    if name.len() < TARGET_ID_LEN {
        return None;
    }
    let prefix = &name[..TARGET_ID_LEN];
    let bytes = STANDARD_NO_PAD.decode(prefix).ok()?;
    let bytes: [u8; 8] = bytes.try_into().ok()?;
    Some(u64::from_le_bytes(bytes))
}

/// Recovers the module id suffix (everything after the `'/'` following the target-id
/// prefix) from a shared-memory name, or `None` if the name is malformed.
pub fn decode_module_id(name: &str) -> Option<String> {
    if name.len() < TARGET_ID_LEN + 1 {
        return None;
    }
    let rest = &name[TARGET_ID_LEN..];
    rest.strip_prefix('/').map(|s| s.to_string())
}

/// One item from the coverage-data provider stream.
#[derive(Debug, Clone)]
pub enum CoverageData {
    /// A new instrumented process has connected and is ready to be tracked.
    InstrumentedProcess { target_id: u64 },
    /// A new LLVM module's inline 8-bit counters have been shared.
    Inline8BitCounters { shared_memory_name: String },
}
