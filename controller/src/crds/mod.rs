pub mod app;
pub mod package_repository;
pub mod status;

pub use app::*;
pub use package_repository::*;
pub use status::*;
