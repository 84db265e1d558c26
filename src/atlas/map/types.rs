//! Core ID and feature types for the Atlas map structures.

/// A 256-bit binary ORB descriptor.
pub type Descriptor = [u8; 32];

/// Hamming distance between two binary descriptors.
#[inline]
pub fn descriptor_distance(a: &Descriptor, b: &Descriptor) -> u32 {
    a.iter().zip(b.iter()).map(|(x, y)| (x ^ y).count_ones()).sum()
}

/// An undistorted keypoint with its pyramid level.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct KeyPoint {
    pub u: f64,
    pub v: f64,
    pub octave: i32,
}

impl KeyPoint {
    pub fn new(u: f64, v: f64, octave: i32) -> Self {
        Self { u, v, octave }
    }
}

/// Unique identifier for a KeyFrame across the whole Atlas.
///
/// KeyFrameIds are assigned sequentially when KeyFrames are created.
/// They serve as lightweight handles for cross-referencing without
/// needing Arc/Rc, which simplifies ownership and avoids cyclic references.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct KeyFrameId(pub u64);

impl KeyFrameId {
    /// Create a new KeyFrameId with the given value.
    pub fn new(id: u64) -> Self {
        Self(id)
    }
}

impl std::fmt::Display for KeyFrameId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "KF{}", self.0)
    }
}

/// Identifier of a Map inside the Atlas.
///
/// Stable across merges: the absorbing map keeps its id, the absorbed one
/// disappears.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MapId(pub u64);

impl std::fmt::Display for MapId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "M{}", self.0)
    }
}

/// Unique identifier for a MapPoint across the whole Atlas.
///
/// MapPointIds are assigned sequentially when MapPoints are created.
/// A MapPoint represents a 3D landmark observed by one or more KeyFrames.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MapPointId(pub u64);

impl MapPointId {
    /// Create a new MapPointId with the given value.
    pub fn new(id: u64) -> Self {
        Self(id)
    }
}

impl std::fmt::Display for MapPointId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "MP{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_keyframe_id_equality() {
        let id1 = KeyFrameId::new(42);
        let id2 = KeyFrameId::new(42);
        let id3 = KeyFrameId::new(43);

        assert_eq!(id1, id2);
        assert_ne!(id1, id3);
    }

    #[test]
    fn test_mappoint_id_display() {
        let id = MapPointId::new(123);
        assert_eq!(format!("{}", id), "MP123");
    }

    #[test]
    fn test_descriptor_distance() {
        let a = [0u8; 32];
        let mut c = [0u8; 32];
        assert_eq!(descriptor_distance(&a, &c), 0);

        c[0] = 0xFF;
        c[31] = 0x0F;
        assert_eq!(descriptor_distance(&a, &c), 12);
    }

    #[test]
    fn test_map_id_display() {
        assert_eq!(MapId(2).to_string(), "M2");
        assert_eq!(KeyFrameId::new(7).to_string(), "KF7");
    }
}
