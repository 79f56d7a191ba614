pub mod genesis;
pub mod types;

pub use types::{Block, BlockHeader};
