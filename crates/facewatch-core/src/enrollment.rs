//! Rebuilding the training corpus from the datastore.

use crate::ports::{Datastore, ImageCodec, PortError};
use crate::preprocess::Preprocessor;
use crate::recognizer::TrainingCorpus;

/// List every identity and its samples, decode and preprocess each sample.
///
/// Labels follow the datastore's identity order. Samples the codec or the
/// preprocessor rejects are skipped; an identity left with no usable samples
/// keeps its label with a count of 0. Listing failures are returned as-is.
pub fn build_corpus(
    datastore: &dyn Datastore,
    codec: &dyn ImageCodec,
    preprocessor: &Preprocessor,
) -> Result<TrainingCorpus, PortError> {
    let mut corpus = TrainingCorpus::new();
    let mut skipped = 0usize;

    for identity in datastore.list_identities()? {
        let refs = datastore.list_samples(identity.id)?;
        let id = identity.id;
        let label = corpus.add_identity(identity);

        for image_ref in refs {
            let decoded = match codec.decode(&image_ref) {
                Ok(img) => img,
                Err(e) => {
                    tracing::warn!(identity = %id, sample = %image_ref, error = %e, "skipping undecodable sample");
                    skipped += 1;
                    continue;
                }
            };
            match preprocessor.preprocess(&decoded) {
                Ok(sample) => corpus.add_sample(label, sample),
                Err(e) => {
                    tracing::warn!(identity = %id, sample = %image_ref, error = %e, "skipping unusable sample");
                    skipped += 1;
                }
            }
        }
    }

    tracing::info!(
        identities = corpus.labels().len(),
        samples = corpus.sample_count(),
        skipped,
        "enrollment corpus rebuilt"
    );
    Ok(corpus)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::types::{Identity, IdentityId, ImageRef, RecognitionEvent};
    use image::{DynamicImage, GrayImage, Luma};
    use std::cell::RefCell;
    use std::collections::HashMap;
    use std::io;

    /// In-memory datastore + codec. Image refs starting with "bad" fail to decode,
    /// refs starting with "empty" decode to a 0x0 image.
    #[derive(Default)]
    pub(crate) struct MemoryStore {
        pub identities: Vec<Identity>,
        pub samples: HashMap<IdentityId, Vec<ImageRef>>,
        pub images: HashMap<String, DynamicImage>,
        pub events: RefCell<Vec<RecognitionEvent>>,
        pub fail_listing: bool,
    }

    impl MemoryStore {
        pub fn enroll(&mut self, id: i64, name: &str, images: Vec<(&str, DynamicImage)>) -> Identity {
            let identity = Identity { id: IdentityId(id), name: name.into() };
            self.identities.push(identity.clone());
            let refs = self.samples.entry(identity.id).or_default();
            for (key, img) in images {
                refs.push(ImageRef(key.into()));
                self.images.insert(key.into(), img);
            }
            identity
        }
    }

    impl Datastore for MemoryStore {
        fn list_identities(&self) -> Result<Vec<Identity>, PortError> {
            if self.fail_listing {
                return Err(PortError::new("list_identities", io::Error::new(io::ErrorKind::Other, "offline")));
            }
            Ok(self.identities.clone())
        }

        fn list_samples(&self, identity: IdentityId) -> Result<Vec<ImageRef>, PortError> {
            Ok(self.samples.get(&identity).cloned().unwrap_or_default())
        }

        fn record_event(&self, event: &RecognitionEvent) -> Result<(), PortError> {
            self.events.borrow_mut().push(event.clone());
            Ok(())
        }
    }

    impl ImageCodec for MemoryStore {
        fn decode(&self, image: &ImageRef) -> Result<DynamicImage, PortError> {
            if image.0.starts_with("empty") {
                return Ok(DynamicImage::new_luma8(0, 0));
            }
            self.images
                .get(&image.0)
                .cloned()
                .ok_or_else(|| PortError::new("decode", io::Error::new(io::ErrorKind::NotFound, image.0.clone())))
        }

        fn encode(&self, _image: &DynamicImage, hint: &str) -> Result<ImageRef, PortError> {
            Ok(ImageRef(format!("mem://{hint}")))
        }
    }

    pub(crate) fn gradient(seed: u8) -> DynamicImage {
        DynamicImage::ImageLuma8(GrayImage::from_fn(32, 32, |x, y| {
            Luma([((x * 7 + y * 3) as u8).wrapping_add(seed)])
        }))
    }

    #[test]
    fn test_labels_follow_listing_order() {
        let mut store = MemoryStore::default();
        store.enroll(7, "Alice", vec![("a1", gradient(1)), ("a2", gradient(2))]);
        store.enroll(3, "Bob", vec![("b1", gradient(3))]);

        let corpus = build_corpus(&store, &store, &Preprocessor::new(32)).unwrap();
        let labels = corpus.labels();
        assert_eq!(labels.len(), 2);
        assert_eq!(labels[0].identity.name, "Alice");
        assert_eq!(labels[0].sample_count, 2);
        assert_eq!(labels[1].identity.id, IdentityId(3));
        assert_eq!(labels[1].sample_count, 1);
        assert_eq!(corpus.sample_count(), 3);
    }

    #[test]
    fn test_bad_samples_are_skipped() {
        let mut store = MemoryStore::default();
        store.enroll(1, "Alice", vec![("a1", gradient(1))]);
        store
            .samples
            .get_mut(&IdentityId(1))
            .unwrap()
            .extend([ImageRef("bad-ref".into()), ImageRef("empty-ref".into())]);

        let corpus = build_corpus(&store, &store, &Preprocessor::new(32)).unwrap();
        assert_eq!(corpus.labels()[0].sample_count, 1);
    }

    #[test]
    fn test_identity_without_samples_keeps_label() {
        let mut store = MemoryStore::default();
        store.enroll(1, "Ghost", vec![]);
        store.enroll(2, "Alice", vec![("a1", gradient(1))]);

        let corpus = build_corpus(&store, &store, &Preprocessor::new(32)).unwrap();
        assert_eq!(corpus.labels()[0].sample_count, 0);
        assert_eq!(corpus.labels()[1].identity.name, "Alice");
        assert_eq!(corpus.sample_count(), 1);
    }

    #[test]
    fn test_listing_failure_propagates() {
        let store = MemoryStore { fail_listing: true, ..MemoryStore::default() };
        let err = build_corpus(&store, &store, &Preprocessor::default()).unwrap_err();
        assert_eq!(err.context(), "list_identities");
    }
}
