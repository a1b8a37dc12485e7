//! facewatch-store: SQLite datastore and filesystem image storage.

pub mod codec;
pub mod db;
pub mod sink;

pub use codec::FsImageCodec;
pub use db::{EventRecord, FaceSample, Place, Store, StoreError, User};
pub use sink::StoreEventSink;
