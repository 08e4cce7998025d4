use rand::RngCore;

/// Default payload size for the echo engine, matching the classic ping(8)
/// 56-byte data section.
pub const DEFAULT_PAYLOAD_SIZE: u16 = 56;

/// Additional data appended to outgoing ICMP Echo Requests.
///
/// The buffer never exceeds 65,535 bytes (the sequence field bounds what a
/// single echo can carry anyway). Contents are pseudo-random so replies can
/// be eyeballed against requests in a capture.
#[derive(Debug, Clone, Default)]
pub struct Payload(Vec<u8>);

impl Payload {
    pub fn new(size: u16) -> Self {
        let mut payload = Payload::default();
        payload.resize(size);
        payload
    }

    /// Replaces the buffer with `size` fresh random bytes.
    pub fn resize(&mut self, size: u16) {
        let mut buf = vec![0u8; size as usize];
        rand::thread_rng().fill_bytes(&mut buf);
        self.0 = buf;
    }

    /// Replaces the buffer wholesale, truncating to 65,535 bytes.
    pub fn set(&mut self, mut data: Vec<u8>) {
        data.truncate(u16::MAX as usize);
        self.0 = data;
    }

    pub fn len(&self) -> u16 {
        self.0.len() as u16
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl AsRef<[u8]> for Payload {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resize_allocates_exactly() {
        let mut payload = Payload::default();
        assert!(payload.is_empty());

        payload.resize(56);
        assert_eq!(payload.len(), 56);
        assert_eq!(payload.as_bytes().len(), 56);

        payload.resize(0);
        assert!(payload.is_empty());
    }

    #[test]
    fn resize_randomizes() {
        let mut a = Payload::default();
        let mut b = Payload::default();
        a.resize(64);
        b.resize(64);
        // 64 random bytes colliding is beyond unlucky
        assert_ne!(a.as_bytes(), b.as_bytes());
    }

    #[test]
    fn set_truncates_oversized_input() {
        let mut payload = Payload::default();
        payload.set(vec![0xab; 70_000]);
        assert_eq!(payload.len(), u16::MAX);
    }
}
