pub mod codec;
pub mod error;
pub mod memo;
pub mod models;

pub use error::Error;

pub type Result<T> = std::result::Result<T, Error>;
