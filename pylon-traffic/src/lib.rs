pub mod cache;
pub mod lru;
pub mod sliding_window;
pub mod token_bucket;

pub use token_bucket::Decision;
