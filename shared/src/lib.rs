pub mod cache;
pub mod codec;
pub mod error;
pub mod repository;
pub mod types;
pub mod upstream;

pub use error::{Error, Result};
