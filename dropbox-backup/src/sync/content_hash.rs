use std::fs::File;
use std::io::{self, Read};
use std::path::Path;

use sha2::{Digest, Sha256};

/// Dropbox hashes content in 4 MiB blocks.
pub const BLOCK_SIZE: usize = 4 * 1024 * 1024;

/// Incremental form of the Dropbox content hash: SHA-256 of every 4 MiB
/// block, then SHA-256 over the concatenated block digests.
#[derive(Clone, Default)]
pub struct ContentHasher {
    overall: Sha256,
    block: Sha256,
    block_len: usize,
}

impl ContentHasher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&mut self, mut data: &[u8]) {
        while !data.is_empty() {
            let take = (BLOCK_SIZE - self.block_len).min(data.len());
            self.block.update(&data[..take]);
            self.block_len += take;
            data = &data[take..];
            if self.block_len == BLOCK_SIZE {
                self.finish_block();
            }
        }
    }

    pub fn finalize(mut self) -> String {
        if self.block_len > 0 {
            self.finish_block();
        }
        format!("{:x}", self.overall.finalize())
    }

    fn finish_block(&mut self) {
        let digest = std::mem::take(&mut self.block).finalize();
        self.overall.update(digest);
        self.block_len = 0;
    }
}

pub fn content_hash_reader<R: Read>(mut reader: R) -> io::Result<String> {
    let mut hasher = ContentHasher::new();
    let mut buf = vec![0u8; 64 * 1024];
    loop {
        let read = match reader.read(&mut buf) {
            Ok(0) => break,
            Ok(read) => read,
            Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
            Err(err) => return Err(err),
        };
        hasher.update(&buf[..read]);
    }
    Ok(hasher.finalize())
}

pub fn content_hash_file(path: &Path) -> io::Result<String> {
    content_hash_reader(File::open(path)?)
}

pub fn content_hash_bytes(data: &[u8]) -> String {
    let mut hasher = ContentHasher::new();
    hasher.update(data);
    hasher.finalize()
}
