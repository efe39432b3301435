//! Content hashing: the `ContentHash` type used to identify everything this
//! engine compares — file contents, directory signatures, aggregate tree
//! hashes, and serialized value snapshots.

use std::fmt;
use std::io;
use std::io::prelude::*;

use anyhow::{Context, Result, ensure};
use data_encoding::BASE32_DNSSEC as BASE32HEX;
use sha2::{Digest, Sha256, digest::Output};

type Sha256Digest = Output<Sha256>;

/// A SHA256 digest, used throughout the engine to identify content:
/// file bytes, directory signatures, aggregate tree hashes, and serialized
/// value snapshots all reduce to one of these.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct ContentHash {
    digest: Sha256Digest,
}

impl ContentHash {
    /// Hashes the given bytes directly.
    pub fn of_bytes(bytes: &[u8]) -> Self {
        Self {
            digest: Sha256::digest(bytes),
        }
    }

    fn from_digest(digest: Sha256Digest) -> Self {
        Self { digest }
    }

    /// A git-like shortened form, unique enough for logging.
    pub fn short_name(&self) -> String {
        let mut full = format!("{self}");
        let _rest = full.split_off(8);
        full
    }

    /// A running hash builder, for combining several pieces of content
    /// (e.g. a tree's entries) into a single aggregate hash without
    /// materializing them all at once.
    pub fn builder() -> ContentHashBuilder {
        ContentHashBuilder {
            hasher: Sha256::new(),
        }
    }
}

impl fmt::Debug for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{ digest: {} }}", BASE32HEX.encode(&self.digest))
    }
}

impl fmt::Display for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", BASE32HEX.encode(&self.digest))
    }
}

impl std::str::FromStr for ContentHash {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = BASE32HEX
            .decode(s.as_bytes())
            .with_context(|| format!("Couldn't decode {s} as base32"))?;

        ensure!(
            bytes.len() == <Sha256 as Digest>::output_size(),
            "Expected SHA256 base32hex"
        );
        Ok(ContentHash::from_digest(*Sha256Digest::from_slice(&bytes)))
    }
}

impl serde::Serialize for ContentHash {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        // Raw bytes on disk; hex when prettified for the inspection CLI.
        if crate::prettify::should_prettify() {
            serializer.serialize_str(&BASE32HEX.encode(self.digest.as_slice()))
        } else {
            serializer.serialize_bytes(self.digest.as_slice())
        }
    }
}

impl<'de> serde::Deserialize<'de> for ContentHash {
    fn deserialize<D>(deserializer: D) -> Result<ContentHash, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let bytes: Vec<u8> = serde_bytes::deserialize(deserializer)?;
        Ok(ContentHash::from_digest(*Sha256Digest::from_slice(&bytes)))
    }
}

/// Accumulates bytes into a single [`ContentHash`], used to build aggregate
/// hashes (e.g. a file-tree snapshot's hash) out of several contributing
/// pieces without having to concatenate them into one buffer first.
pub struct ContentHashBuilder {
    hasher: Sha256,
}

impl ContentHashBuilder {
    pub fn update(&mut self, bytes: &[u8]) -> &mut Self {
        self.hasher.update(bytes);
        self
    }

    pub fn finish(self) -> ContentHash {
        ContentHash::from_digest(self.hasher.finalize())
    }
}

pub struct HashingReader<R> {
    inner: R,
    hasher: Sha256,
}

impl<R: Read> HashingReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            hasher: Sha256::new(),
        }
    }

    pub fn finalize(self) -> (ContentHash, R) {
        (ContentHash::from_digest(self.hasher.finalize()), self.inner)
    }
}

impl<R: Read> Read for HashingReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let count = self.inner.read(buf)?;
        self.hasher.update(&buf[..count]);
        Ok(count)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    const DEVELOPERS: &[u8] = b"Developers, developers, developers, developers!".as_slice();

    #[test]
    fn stable_digest() {
        let a = ContentHash::of_bytes(DEVELOPERS);
        let b = ContentHash::of_bytes(DEVELOPERS);
        assert_eq!(a, b);
    }

    #[test]
    fn round_trips_through_display() -> Result<()> {
        let id = ContentHash::of_bytes(DEVELOPERS);
        let parsed: ContentHash = format!("{id}").parse()?;
        assert_eq!(id, parsed);
        Ok(())
    }

    #[test]
    fn reader_matches_of_bytes() -> Result<()> {
        let mut r = HashingReader::new(DEVELOPERS);
        io::copy(&mut r, &mut io::sink())?;
        assert_eq!(r.finalize().0, ContentHash::of_bytes(DEVELOPERS));
        Ok(())
    }

    #[test]
    fn builder_matches_of_bytes_for_single_chunk() {
        let mut b = ContentHash::builder();
        b.update(DEVELOPERS);
        assert_eq!(b.finish(), ContentHash::of_bytes(DEVELOPERS));
    }
}
