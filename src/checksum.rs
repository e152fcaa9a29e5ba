//! Checksum and hashing utilities

use std::fs::File;
use std::io::{self, Read};
use std::path::Path;

use serde::{Deserialize, Serialize};

/// Available checksum algorithms
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum ChecksumType {
    /// What the collector dashboard verifies against
    #[default]
    Md5,
    Blake3,
}

/// Incremental hasher over either algorithm
pub enum Hasher {
    Md5(md5::Context),
    Blake3(Box<blake3::Hasher>),
}

impl Hasher {
    pub fn new(kind: ChecksumType) -> Self {
        match kind {
            ChecksumType::Md5 => Self::Md5(md5::Context::new()),
            ChecksumType::Blake3 => Self::Blake3(Box::new(blake3::Hasher::new())),
        }
    }

    pub fn update(&mut self, data: &[u8]) {
        match self {
            Self::Md5(ctx) => ctx.consume(data),
            Self::Blake3(h) => {
                h.update(data);
            }
        }
    }

    /// Lowercase hex digest
    pub fn finalize_hex(self) -> String {
        match self {
            Self::Md5(ctx) => hex::encode(ctx.compute().0),
            Self::Blake3(h) => h.finalize().to_hex().to_string(),
        }
    }
}

/// Hash an in-memory buffer
pub fn checksum_bytes(data: &[u8], kind: ChecksumType) -> String {
    let mut hasher = Hasher::new(kind);
    hasher.update(data);
    hasher.finalize_hex()
}

/// Stream a whole file through the hasher in 64KB chunks
pub fn checksum_file(path: &Path, kind: ChecksumType) -> io::Result<String> {
    let mut hasher = Hasher::new(kind);
    let mut buffer = vec![0u8; 64 * 1024];
    let mut file = File::open(path)?;

    loop {
        let bytes_read = file.read(&mut buffer)?;
        if bytes_read == 0 {
            break;
        }
        hasher.update(&buffer[..bytes_read]);
    }

    Ok(hasher.finalize_hex())
}
