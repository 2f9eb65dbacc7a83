pub mod lenient;
pub mod symbol;
pub mod timezone;
pub mod upload_store;

pub use symbol::parse_symbols;
pub use timezone::{OhlcTimezone, TimezoneError};
pub use upload_store::{UploadError, UploadStore};
