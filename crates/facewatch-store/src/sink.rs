use crate::codec::FsImageCodec;
use crate::db::Store;
use facewatch_core::ports::{Datastore, EventSink, ImageCodec, PortError};
use facewatch_core::types::{Identity, RecognitionEvent};
use image::DynamicImage;

/// Saves the face crop and records a recognition event at one place.
pub struct StoreEventSink<'a> {
    store: &'a Store,
    codec: &'a FsImageCodec,
    place_id: i64,
}

impl<'a> StoreEventSink<'a> {
    pub fn new(store: &'a Store, codec: &'a FsImageCodec, place_id: i64) -> Self {
        Self { store, codec, place_id }
    }
}

impl EventSink for StoreEventSink<'_> {
    fn record(&self, identity: &Identity, crop: &DynamicImage, confidence: f32) -> Result<(), PortError> {
        let image = self.codec.encode(crop, &identity.name)?;
        self.store.record_event(&RecognitionEvent {
            identity: identity.id,
            place: self.place_id,
            image,
            confidence,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    #[test]
    fn test_record_writes_crop_and_event() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::in_memory().unwrap();
        let codec = FsImageCodec::new(dir.path());
        let alice = store.add_user("Alice").unwrap();
        let place = store.ensure_place("Default Location").unwrap();

        let sink = StoreEventSink::new(&store, &codec, place.id);
        let crop = DynamicImage::new_rgb8(32, 32);
        sink.record(&alice.identity(), &crop, 82.5).unwrap();

        let events = store.events_at_place(place.id).unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].user_id, alice.id);
        assert_eq!(events[0].confidence, Some(82.5));
        assert!(Path::new(&events[0].image_path).exists());
    }
}
