//! Streaming content checksums
//!
//! Log files are identified by the digest of their bytes, so a rotated or copied
//! file with identical content hashes to the same value.

use crate::error::Result;
use crate::types::ChecksumAlgorithm;
use sha2::{Digest, Sha256, Sha512};
use std::io::Read;
use std::path::Path;

const READ_BUFFER_SIZE: usize = 64 * 1024;

/// Compute the hex checksum of a file
pub fn compute_file_checksum(
    path: impl AsRef<Path>,
    algorithm: ChecksumAlgorithm,
) -> Result<String> {
    let mut file = std::fs::File::open(path)?;
    compute_checksum(&mut file, algorithm)
}

/// Compute the hex checksum of any readable source
pub fn compute_checksum<R: Read>(reader: &mut R, algorithm: ChecksumAlgorithm) -> Result<String> {
    let mut hashing = HashingReader::new(reader, algorithm);
    let mut buffer = vec![0u8; READ_BUFFER_SIZE];
    while hashing.read(&mut buffer)? != 0 {}
    Ok(hashing.finish())
}

enum Hasher {
    Sha256(Sha256),
    Sha512(Sha512),
}

/// Reader that hashes every byte read through it
pub struct HashingReader<R> {
    inner: R,
    hasher: Hasher,
    bytes_read: u64,
}

impl<R: Read> HashingReader<R> {
    pub fn new(inner: R, algorithm: ChecksumAlgorithm) -> Self {
        let hasher = match algorithm {
            ChecksumAlgorithm::Sha256 => Hasher::Sha256(Sha256::new()),
            ChecksumAlgorithm::Sha512 => Hasher::Sha512(Sha512::new()),
        };
        Self {
            inner,
            hasher,
            bytes_read: 0,
        }
    }

    pub fn bytes_read(&self) -> u64 {
        self.bytes_read
    }

    /// Hex digest of everything read so far
    pub fn finish(self) -> String {
        match self.hasher {
            Hasher::Sha256(hasher) => hex::encode(hasher.finalize()),
            Hasher::Sha512(hasher) => hex::encode(hasher.finalize()),
        }
    }
}

impl<R: Read> Read for HashingReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        let n = self.inner.read(buf)?;
        match &mut self.hasher {
            Hasher::Sha256(hasher) => hasher.update(&buf[..n]),
            Hasher::Sha512(hasher) => hasher.update(&buf[..n]),
        }
        self.bytes_read += n as u64;
        Ok(n)
    }
}
