pub mod error;

pub use error::{OverseerError, Result};
