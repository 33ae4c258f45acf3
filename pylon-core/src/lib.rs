pub mod config;
pub mod context;
pub mod error;
pub mod route;
pub mod router;
pub mod upstream;
