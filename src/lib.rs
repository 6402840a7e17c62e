pub mod db;
pub mod error;
pub mod models;
pub mod registry;

pub use db::Database;
pub use error::TagError;
pub use registry::TagRegistry;
