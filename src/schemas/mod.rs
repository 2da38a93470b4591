pub mod common;
pub mod export;
