//! Random byte source for `/dev/random` and `/dev/urandom`
//!
//! Bytes come from the host's entropy source (`crypto.getRandomValues` in
//! the browser, the OS elsewhere). If that fails the device falls back to a
//! xorshift generator seeded from the clock. Reads never block.

use crate::platform;

pub struct RandomSource {
    fallback: u64,
}

impl RandomSource {
    pub fn new() -> Self {
        let seed = (platform::now_ms() * 1000.0) as u64;
        Self {
            fallback: seed | 1,
        }
    }

    pub fn fill(&mut self, buf: &mut [u8]) {
        if getrandom::getrandom(buf).is_ok() {
            return;
        }
        log::debug!("host entropy unavailable, using fallback generator");
        for chunk in buf.chunks_mut(8) {
            let bytes = self.next_fallback().to_le_bytes();
            chunk.copy_from_slice(&bytes[..chunk.len()]);
        }
    }

    fn next_fallback(&mut self) -> u64 {
        let mut x = self.fallback;
        x ^= x << 13;
        x ^= x >> 7;
        x ^= x << 17;
        self.fallback = x;
        x
    }
}

impl Default for RandomSource {
    fn default() -> Self {
        Self::new()
    }
}
