pub mod clock;
pub mod error;
pub mod kv;
pub mod records;
pub mod store;

pub use clock::{Clock, SystemClock};
pub use error::StateError;
pub use kv::{FileKvStore, KvStore, RecordKind};
pub use records::*;
pub use store::StateStore;
