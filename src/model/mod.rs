pub mod clip;
pub mod metadata;
pub mod record;

pub use clip::Clip;
pub use metadata::{ClipMetadata, LabelSet, Prediction};
pub use record::{RecordError, RecordLoad};
