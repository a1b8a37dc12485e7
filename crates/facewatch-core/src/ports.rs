//! Collaborator interfaces: persistence, frame acquisition, image coding.
//!
//! The core never touches SQLite, V4L2 or the filesystem directly; the
//! surrounding crates implement these traits.

use crate::types::{Identity, IdentityId, ImageRef, RecognitionEvent};
use image::DynamicImage;
use thiserror::Error;

type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Opaque failure of a collaborator call. The core never retries.
#[derive(Error, Debug)]
#[error("{context}: {source}")]
pub struct PortError {
    context: &'static str,
    #[source]
    source: BoxError,
}

impl PortError {
    pub fn new(context: &'static str, source: impl Into<BoxError>) -> Self {
        Self { context, source: source.into() }
    }

    pub fn context(&self) -> &'static str {
        self.context
    }
}

/// Identity and sample listing plus event recording.
pub trait Datastore {
    fn list_identities(&self) -> Result<Vec<Identity>, PortError>;
    fn list_samples(&self, identity: IdentityId) -> Result<Vec<ImageRef>, PortError>;
    fn record_event(&self, event: &RecognitionEvent) -> Result<(), PortError>;
}

/// Supplies frames on demand.
pub trait FrameSource {
    /// `Ok(None)` means no frame is available right now.
    fn next_frame(&mut self) -> Result<Option<DynamicImage>, PortError>;

    /// True once no further frames will ever arrive. Live sources never end.
    fn is_exhausted(&self) -> bool {
        false
    }
}

/// Converts stored image references to pixels and back.
pub trait ImageCodec {
    fn decode(&self, image: &ImageRef) -> Result<DynamicImage, PortError>;
    /// Persist `image` and return a reference to it. `hint` names the subject.
    fn encode(&self, image: &DynamicImage, hint: &str) -> Result<ImageRef, PortError>;
}

/// Where stable recognitions are delivered.
pub trait EventSink {
    fn record(&self, identity: &Identity, crop: &DynamicImage, confidence: f32) -> Result<(), PortError>;
}

impl<T: Datastore + ?Sized> Datastore for &T {
    fn list_identities(&self) -> Result<Vec<Identity>, PortError> {
        (**self).list_identities()
    }

    fn list_samples(&self, identity: IdentityId) -> Result<Vec<ImageRef>, PortError> {
        (**self).list_samples(identity)
    }

    fn record_event(&self, event: &RecognitionEvent) -> Result<(), PortError> {
        (**self).record_event(event)
    }
}

impl<T: EventSink + ?Sized> EventSink for &T {
    fn record(&self, identity: &Identity, crop: &DynamicImage, confidence: f32) -> Result<(), PortError> {
        (**self).record(identity, crop, confidence)
    }
}

impl<T: FrameSource + ?Sized> FrameSource for Box<T> {
    fn next_frame(&mut self) -> Result<Option<DynamicImage>, PortError> {
        (**self).next_frame()
    }

    fn is_exhausted(&self) -> bool {
        (**self).is_exhausted()
    }
}

/// Frame source over a fixed list of frames; `None` entries stand for
/// missing frames. Exhausted once the list is consumed.
pub struct FrameList {
    frames: std::vec::IntoIter<Option<DynamicImage>>,
}

impl FrameList {
    pub fn new(frames: Vec<Option<DynamicImage>>) -> Self {
        Self { frames: frames.into_iter() }
    }
}

impl FrameSource for FrameList {
    fn next_frame(&mut self) -> Result<Option<DynamicImage>, PortError> {
        Ok(self.frames.next().flatten())
    }

    fn is_exhausted(&self) -> bool {
        self.frames.len() == 0
    }
}

/// Stops a frame source after `limit` pulls.
pub struct TakeFrames<S> {
    inner: S,
    remaining: usize,
}

impl<S: FrameSource> TakeFrames<S> {
    pub fn new(inner: S, limit: usize) -> Self {
        Self { inner, remaining: limit }
    }

    pub fn into_inner(self) -> S {
        self.inner
    }
}

impl<S: FrameSource> FrameSource for TakeFrames<S> {
    fn next_frame(&mut self) -> Result<Option<DynamicImage>, PortError> {
        if self.remaining == 0 {
            return Ok(None);
        }
        self.remaining -= 1;
        self.inner.next_frame()
    }

    fn is_exhausted(&self) -> bool {
        self.remaining == 0 || self.inner.is_exhausted()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;

    #[test]
    fn test_port_error_display() {
        let err = PortError::new("list_samples", io::Error::new(io::ErrorKind::Other, "disk gone"));
        assert_eq!(err.context(), "list_samples");
        assert_eq!(err.to_string(), "list_samples: disk gone");
        assert!(std::error::Error::source(&err).is_some());
    }

    #[test]
    fn test_frame_list_yields_missing_frames() {
        let img = DynamicImage::new_luma8(4, 4);
        let mut src = FrameList::new(vec![None, Some(img)]);
        assert!(src.next_frame().unwrap().is_none());
        assert!(src.next_frame().unwrap().is_some());
        assert!(src.is_exhausted());
        assert!(src.next_frame().unwrap().is_none());
    }

    #[test]
    fn test_take_frames_limits_pulls() {
        let frames = (0..5).map(|_| Some(DynamicImage::new_luma8(2, 2))).collect();
        let mut src = TakeFrames::new(FrameList::new(frames), 2);
        assert!(!src.is_exhausted());
        assert!(src.next_frame().unwrap().is_some());
        assert!(src.next_frame().unwrap().is_some());
        assert!(src.is_exhausted());
        assert!(src.next_frame().unwrap().is_none());
        assert!(!src.into_inner().is_exhausted());
    }
}
