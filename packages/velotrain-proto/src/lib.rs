pub mod record;
pub mod tod;
pub mod wire;

pub use record::{Channel, ProcessedPassing, RawPassing, StatusRecord};
pub use tod::Tod;
