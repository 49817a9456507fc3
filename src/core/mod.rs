pub mod error;

pub use error::{DalError, Result};
