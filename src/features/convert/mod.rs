pub mod cache;
pub mod decode;
pub mod handler;
mod service;
mod stream;
mod types;

pub use cache::ResultCache;
pub use handler::{X_CACHE, create_convert_router};
pub use service::{ConversionService, SingleOutcome};
pub use stream::{AbortReason, PreparedFrame, StreamOutcome, frame_record};
pub use types::{ConvertQuery, ImageUpload};
