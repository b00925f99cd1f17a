use sha2::{Digest, Sha256};
use std::fs::File;
use std::io::{self, Read};
use std::path::Path;

pub const BLOCK_SIZE: usize = 4096;

/// SHA-256 of everything `reader` yields, as lowercase hex. Reads in fixed blocks.
pub fn fingerprint_reader<R: Read>(mut reader: R) -> io::Result<String> {
    let mut hasher = Sha256::new();
    let mut block = [0u8; BLOCK_SIZE];

    loop {
        let read = match reader.read(&mut block) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        };
        hasher.update(&block[..read]);
    }

    Ok(format!("{:x}", hasher.finalize()))
}

/// Fingerprint of a file, or `None` if it cannot be read. Callers must check.
pub fn fingerprint_file(path: &Path) -> Option<String> {
    let result = File::open(path).and_then(fingerprint_reader);
    match result {
        Ok(fingerprint) => Some(fingerprint),
        Err(e) => {
            tracing::warn!("cannot read {} for hashing: {}", path.display(), e);
            None
        }
    }
}
