//! Handle types for entities owned by the map arena.
//!
//! Handles are stable integer ids rather than references; the arena owns the
//! entity and tombstones it with a `bad` flag instead of freeing in place, so
//! the tracking and mapping threads can hold handles across mutations.

/// Unique identifier for a processed frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FrameId(pub u64);

impl std::fmt::Display for FrameId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "F{}", self.0)
    }
}

/// Unique identifier for a keyframe within the map.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct KeyFrameId(pub u64);

impl std::fmt::Display for KeyFrameId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "KF{}", self.0)
    }
}

/// Unique identifier for a map point within the map.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct MapPointId(pub u64);

impl std::fmt::Display for MapPointId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "MP{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_id_ordering() {
        assert!(KeyFrameId(1) < KeyFrameId(2));
        assert_eq!(FrameId(7), FrameId(7));
    }

    #[test]
    fn test_display() {
        assert_eq!(format!("{}", MapPointId(123)), "MP123");
        assert_eq!(format!("{}", KeyFrameId(4)), "KF4");
    }
}
