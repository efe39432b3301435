//! Change the entire program's serialization scheme with this one weird trick!

use std::sync::atomic::{AtomicBool, Ordering};

static PRETTIFY: AtomicBool = AtomicBool::new(false);

/// Indicate that various fields should be prettified for inspection output.
///
/// We store things compactly on disk: hashes as raw bytes, timestamps as
/// nanoseconds since the epoch. But the demonstration CLI wants to print
/// them nicely, as base32 and RFC 3339 respectively. Since the commands that
/// want pretty output never re-serialize anything back to the store, we can
/// hijack serialize calls to prettify them: call `prettify_serialize()` once
/// at startup, and the relevant serializers check `should_prettify()`.
pub fn prettify_serialize() {
    PRETTIFY.store(true, Ordering::Relaxed);
}

#[inline]
pub fn should_prettify() -> bool {
    PRETTIFY.load(Ordering::Relaxed)
}

/// (De)serializes an `Option<jiff::Timestamp>` as nanoseconds since the
/// epoch on disk, or as an RFC 3339 string when [`should_prettify`] is set.
pub mod timestamp_option {
    use jiff::Timestamp;
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S: Serializer>(
        ts: &Option<Timestamp>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        if super::should_prettify() {
            ts.map(|t| t.to_string()).serialize(serializer)
        } else {
            ts.map(|t| t.as_nanosecond()).serialize(serializer)
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Timestamp>, D::Error> {
        let nanos = Option::<i128>::deserialize(d)?;
        nanos
            .map(Timestamp::from_nanosecond)
            .transpose()
            .map_err(serde::de::Error::custom)
    }
}
