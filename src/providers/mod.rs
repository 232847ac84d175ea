pub mod apify;
pub mod assemblyai;
pub mod poll;
pub mod traits;

#[cfg(test)]
pub mod stub;

pub use apify::ApifyClient;
pub use assemblyai::{AssemblyAiClient, CallbackAuth};
