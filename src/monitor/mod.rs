pub mod resource_monitor;
pub mod sampler;
pub mod types;

#[cfg(test)]
mod tests;

pub use resource_monitor::*;
pub use sampler::*;
pub use types::*;
