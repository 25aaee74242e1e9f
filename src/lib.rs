pub mod agent;
pub mod assert;
pub mod backend;
pub mod error;
pub mod metadata;
pub mod prelude;
pub mod session;
pub mod settings;
pub mod wait;

pub use error::{Error, Result};
