pub mod queue;
pub mod types;
pub mod worker_pool;

#[cfg(test)]
mod tests;

pub use queue::*;
pub use types::*;
pub use worker_pool::*;
