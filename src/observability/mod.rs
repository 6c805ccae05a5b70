pub mod access;
pub mod logger;
pub mod request_id;

pub use access::AccessCounters;
pub use logger::{f, AccessRecord, Field, Logger};
