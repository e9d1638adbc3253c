//! SHA256 digest utilities for image assembly
//!
//! Layer digests are computed while the layer is written, through [`DigestWriter`],
//! so the digest always covers exactly the bytes that reached the disk.

use sha2::{Digest, Sha256};
use std::io::{self, Write};

/// Utilities for working with SHA256 digests in Docker context
pub struct DigestUtils;

impl DigestUtils {
    /// Compute SHA256 hex digest from byte data
    pub fn compute_sha256(data: &[u8]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(data);
        hex::encode(hasher.finalize())
    }

    /// Format digest for display (truncated for readability)
    pub fn format_digest_short(digest: &str) -> String {
        if digest.len() > 19 {
            format!("{}...", &digest[..19])
        } else {
            digest.to_string()
        }
    }
}

/// Writer that forwards to `inner` and hashes every byte `inner` accepted.
pub struct DigestWriter<W: Write> {
    inner: W,
    hasher: Sha256,
    written: u64,
}

impl<W: Write> DigestWriter<W> {
    pub fn new(inner: W) -> Self {
        Self {
            inner,
            hasher: Sha256::new(),
            written: 0,
        }
    }

    pub fn bytes_written(&self) -> u64 {
        self.written
    }

    /// Finish hashing; returns the inner writer and the `sha256:` digest.
    pub fn finish(self) -> (W, String) {
        let digest = format!("sha256:{}", hex::encode(self.hasher.finalize()));
        (self.inner, digest)
    }
}

impl<W: Write> Write for DigestWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.hasher.update(&buf[..n]);
        self.written += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Writer that accepts at most 3 bytes per call
    struct Trickle(Vec<u8>);

    impl Write for Trickle {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            let n = buf.len().min(3);
            self.0.extend_from_slice(&buf[..n]);
            Ok(n)
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_empty_content_digest() {
        assert_eq!(
            DigestUtils::compute_sha256(b""),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }

    #[test]
    fn test_digest_writer_hashes_only_accepted_bytes() {
        let mut writer = DigestWriter::new(Trickle(Vec::new()));
        writer.write_all(b"layer content that arrives in pieces").unwrap();
        assert_eq!(writer.bytes_written(), 36);

        let (inner, digest) = writer.finish();
        assert_eq!(inner.0, b"layer content that arrives in pieces");
        assert_eq!(digest, format!("sha256:{}", DigestUtils::compute_sha256(&inner.0)));
    }

    #[test]
    fn test_format_digest_short() {
        let digest = format!("sha256:{}", DigestUtils::compute_sha256(b"abc"));
        assert_eq!(DigestUtils::format_digest_short(&digest), "sha256:ba7816bf8f01...");
        assert_eq!(DigestUtils::format_digest_short("sha256:ab"), "sha256:ab");
    }
}
