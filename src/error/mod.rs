mod types;

pub use types::{PatchGridError, Result};
