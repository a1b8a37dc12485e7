use serde::{Deserialize, Serialize};
use std::fmt;

/// Axis-aligned bounding box for a face (or eye) region, in pixel coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Region {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl Region {
    pub fn new(x: u32, y: u32, width: u32, height: u32) -> Self {
        Self { x, y, width, height }
    }

    pub fn area(&self) -> u64 {
        self.width as u64 * self.height as u64
    }

    /// Clip the region to an image of the given size.
    ///
    /// Returns `None` when nothing of the region lies inside the image.
    pub fn clamp_to(&self, width: u32, height: u32) -> Option<Region> {
        if self.x >= width || self.y >= height {
            return None;
        }
        let w = self.width.min(width - self.x);
        let h = self.height.min(height - self.y);
        if w == 0 || h == 0 {
            return None;
        }
        Some(Region::new(self.x, self.y, w, h))
    }
}

/// Datastore key of an enrolled person.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct IdentityId(pub i64);

impl fmt::Display for IdentityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// An enrolled person as seen by the core: an opaque key plus a display name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    pub id: IdentityId,
    pub name: String,
}

/// Reference to a stored image (an enrollment sample or an event crop).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ImageRef(pub String);

impl fmt::Display for ImageRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Who a single recognition claims to have seen.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Claim {
    Known(Identity),
    Unknown,
}

impl Claim {
    pub fn identity(&self) -> Option<&Identity> {
        match self {
            Claim::Known(identity) => Some(identity),
            Claim::Unknown => None,
        }
    }
}

impl fmt::Display for Claim {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Claim::Known(identity) => f.write_str(&identity.name),
            Claim::Unknown => f.write_str("unknown"),
        }
    }
}

/// One recognition of one face in one frame.
///
/// `confidence` is in [0, 100] and is reported even when the claim is
/// `Unknown`, for diagnostics.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Observation {
    pub claim: Claim,
    pub confidence: f32,
}

impl Observation {
    pub fn known(identity: Identity, confidence: f32) -> Self {
        Self { claim: Claim::Known(identity), confidence }
    }

    pub fn unknown(confidence: f32) -> Self {
        Self { claim: Claim::Unknown, confidence }
    }
}

/// A recognition event ready to be persisted by the datastore.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecognitionEvent {
    pub identity: IdentityId,
    pub place: i64,
    pub image: ImageRef,
    pub confidence: f32,
}
