use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

/// A position on the identifier ring.
///
/// Identifiers are fixed-width u64, so rings up to m = 64 bits are
/// supported. All arithmetic is done modulo 2^m.
pub type Id = u64;

/// The identifier ring of size 2^m.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Ring {
    bits: u32,
}

impl Ring {
    pub fn new(bits: u32) -> Self {
        assert!((1..=64).contains(&bits), "identifier bits must be in 1..=64");
        Self { bits }
    }

    pub fn bits(&self) -> u32 {
        self.bits
    }

    fn mask(&self) -> Id {
        if self.bits == 64 {
            u64::MAX
        } else {
            (1u64 << self.bits) - 1
        }
    }

    /// sha256 of the input, interpreted big-endian and reduced mod 2^m.
    pub fn identifier(&self, input: &str) -> Id {
        let digest = Sha256::digest(input.as_bytes());
        let mut tail = [0u8; 8];
        tail.copy_from_slice(&digest[24..]);
        u64::from_be_bytes(tail) & self.mask()
    }

    /// identifier + 2^i mod 2^m, the start of the i-th finger.
    pub fn finger_offset(&self, identifier: Id, i: u32) -> Id {
        identifier.wrapping_add(1u64 << i) & self.mask()
    }

    /// Modular interval membership for all four open/close variants.
    ///
    /// Invariant: a degenerate interval (a == b) covers the whole ring in
    /// every variant, so a lookup on a one-peer ring resolves to that peer.
    pub fn contains(&self, x: Id, a: Id, b: Id, left_open: bool, right_open: bool) -> bool {
        let mask = self.mask();
        let (x, a, b) = (x & mask, a & mask, b & mask);
        if a == b {
            return true;
        }
        let span = b.wrapping_sub(a) & mask;
        let offset = x.wrapping_sub(a) & mask;
        let after_left = !left_open || offset != 0;
        let before_right = if right_open {
            offset < span
        } else {
            offset <= span
        };
        after_left && before_right
    }
}

/// Address and ring position of a peer. A value, never a handle: a
/// NodeInfo referring to the local peer carries no ownership of it.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct NodeInfo {
    pub identifier: Id,
    pub host: String,
    pub port: u16,
}

impl NodeInfo {
    pub fn new(ring: Ring, host: &str, port: u16) -> Self {
        let identifier = ring.identifier(&format!("{host}:{port}"));
        Self {
            identifier,
            host: host.to_string(),
            port,
        }
    }

    /// The null-like absent value used throughout the routing state.
    pub fn empty() -> Self {
        Self {
            identifier: 0,
            host: String::new(),
            port: 0,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.host.is_empty()
    }

    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl fmt::Display for NodeInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            write!(f, "(empty)")
        } else {
            write!(f, "{}@{}:{}", self.identifier, self.host, self.port)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::Rng;

    // the walk definition of (a, b]: start just past a, x is in if it is
    // reached at or before b
    fn walk_contains(ring: Ring, x: Id, a: Id, b: Id, left_open: bool, right_open: bool) -> bool {
        let mask = if ring.bits() == 64 {
            u64::MAX
        } else {
            (1u64 << ring.bits()) - 1
        };
        let first = if left_open {
            a.wrapping_add(1) & mask
        } else {
            a
        };
        let mut cur = first;
        loop {
            if right_open && cur == b {
                return false;
            }
            if cur == x {
                return true;
            }
            if !right_open && cur == b {
                return false;
            }
            cur = cur.wrapping_add(1) & mask;
            if cur == first {
                return false;
            }
        }
    }

    #[test]
    fn simple_interval() {
        let ring = Ring::new(6);
        assert!(ring.contains(25, 8, 40, true, false));
        assert!(ring.contains(40, 8, 40, true, false));
        assert!(!ring.contains(8, 8, 40, true, false));
        assert!(ring.contains(8, 8, 40, false, false));
        assert!(!ring.contains(40, 8, 40, true, true));
        assert!(!ring.contains(41, 8, 40, true, false));
    }

    #[test]
    fn wraps_around_ring() {
        let ring = Ring::new(6);
        // (56, 8] wraps through zero
        assert!(ring.contains(60, 56, 8, true, false));
        assert!(ring.contains(0, 56, 8, true, false));
        assert!(ring.contains(8, 56, 8, true, false));
        assert!(!ring.contains(56, 56, 8, true, false));
        assert!(!ring.contains(20, 56, 8, true, false));
    }

    #[test]
    fn degenerate_interval_covers_ring() {
        let ring = Ring::new(6);
        for x in [0u64, 7, 8, 9, 63] {
            assert!(ring.contains(x, 8, 8, true, true));
            assert!(ring.contains(x, 8, 8, true, false));
            assert!(ring.contains(x, 8, 8, false, true));
            assert!(ring.contains(x, 8, 8, false, false));
        }
    }

    #[test]
    fn agrees_with_walk_definition_exhaustively() {
        let ring = Ring::new(4);
        for a in 0u64..16 {
            for b in 0u64..16 {
                if a == b {
                    continue; // degenerate case pinned by its own test
                }
                for x in 0u64..16 {
                    for left_open in [false, true] {
                        for right_open in [false, true] {
                            assert_eq!(
                                ring.contains(x, a, b, left_open, right_open),
                                walk_contains(ring, x, a, b, left_open, right_open),
                                "x={x} a={a} b={b} lo={left_open} ro={right_open}"
                            );
                        }
                    }
                }
            }
        }
    }

    #[test]
    fn agrees_with_walk_definition_sampled() {
        let ring = Ring::new(8);
        let mut rng = rand::rng();
        for _ in 0..5000 {
            let a: Id = rng.random_range(0..256);
            let b: Id = rng.random_range(0..256);
            let x: Id = rng.random_range(0..256);
            if a == b {
                continue;
            }
            let left_open = rng.random_bool(0.5);
            let right_open = rng.random_bool(0.5);
            assert_eq!(
                ring.contains(x, a, b, left_open, right_open),
                walk_contains(ring, x, a, b, left_open, right_open),
            );
        }
    }

    #[test]
    fn identifier_is_reduced_and_stable() {
        let ring = Ring::new(6);
        let id = ring.identifier("127.0.0.1:4000");
        assert!(id < 64);
        assert_eq!(id, ring.identifier("127.0.0.1:4000"));
        // full width keeps all 64 bits
        let wide = Ring::new(64);
        assert_eq!(
            wide.identifier("some-key"),
            wide.identifier("some-key")
        );
    }

    #[test]
    fn finger_offsets_wrap() {
        let ring = Ring::new(6);
        assert_eq!(ring.finger_offset(8, 0), 9);
        assert_eq!(ring.finger_offset(8, 5), 40);
        assert_eq!(ring.finger_offset(60, 3), 4);
    }

    #[test]
    fn empty_node_info_is_total() {
        let empty = NodeInfo::empty();
        assert!(empty.is_empty());
        assert_eq!(empty, NodeInfo::empty());
        let real = NodeInfo::new(Ring::new(32), "127.0.0.1", 4000);
        assert!(!real.is_empty());
        assert_ne!(real, empty);
    }
}
