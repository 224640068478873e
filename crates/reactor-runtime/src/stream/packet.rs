use bytes::{Buf, Bytes, BytesMut};
use std::collections::VecDeque;

/// A chain of byte fragments sent as one unit.
#[derive(Debug, Default, Clone)]
pub struct Packet {
    frags: VecDeque<Bytes>,
    len: usize,
}

impl Packet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a fragment; empty ones are dropped.
    pub fn push(&mut self, frag: Bytes) {
        if frag.is_empty() {
            return;
        }
        self.len += frag.len();
        self.frags.push_back(frag);
    }

    pub fn append(&mut self, mut other: Packet) {
        self.len += other.len;
        self.frags.append(&mut other.frags);
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn fragments(&self) -> impl Iterator<Item = &Bytes> {
        self.frags.iter()
    }

    pub fn fragment_count(&self) -> usize {
        self.frags.len()
    }

    /// Drop `n` bytes from the front.
    pub fn trim_front(&mut self, mut n: usize) {
        n = n.min(self.len);
        self.len -= n;
        while n > 0 {
            let Some(front) = self.frags.front_mut() else {
                break;
            };
            if front.len() <= n {
                n -= front.len();
                self.frags.pop_front();
            } else {
                front.advance(n);
                n = 0;
            }
        }
    }

    /// Copy everything into one contiguous buffer.
    pub fn linearize(&self) -> Bytes {
        if self.frags.len() == 1 {
            return self.frags[0].clone();
        }
        let mut out = BytesMut::with_capacity(self.len);
        for f in &self.frags {
            out.extend_from_slice(f);
        }
        out.freeze()
    }
}

impl From<Bytes> for Packet {
    fn from(b: Bytes) -> Self {
        let mut p = Packet::new();
        p.push(b);
        p
    }
}

impl From<Vec<u8>> for Packet {
    fn from(v: Vec<u8>) -> Self {
        Packet::from(Bytes::from(v))
    }
}

impl From<&'static str> for Packet {
    fn from(s: &'static str) -> Self {
        Packet::from(Bytes::from_static(s.as_bytes()))
    }
}

impl FromIterator<Bytes> for Packet {
    fn from_iter<I: IntoIterator<Item = Bytes>>(iter: I) -> Self {
        let mut p = Packet::new();
        for b in iter {
            p.push(b);
        }
        p
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_trim_front_across_fragments() {
        let mut p: Packet = ["abc", "de", "fghij"].into_iter().map(|s| Bytes::from_static(s.as_bytes())).collect();
        assert_eq!(p.len(), 10);
        p.trim_front(4);
        assert_eq!(p.len(), 6);
        assert_eq!(p.fragment_count(), 2);
        assert_eq!(&p.linearize()[..], b"efghij");
        p.trim_front(100);
        assert!(p.is_empty());
        assert_eq!(p.fragment_count(), 0);
    }

    #[test]
    fn test_empty_fragments_skipped() {
        let mut p = Packet::from("x");
        p.push(Bytes::new());
        p.append(Packet::new());
        assert_eq!(p.fragment_count(), 1);
        assert_eq!(&p.linearize()[..], b"x");
    }
}
