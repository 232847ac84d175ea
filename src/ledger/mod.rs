pub mod memory;
pub mod models;
pub mod repository;
pub mod store;

pub use memory::InMemoryLedger;
pub use repository::LedgerRepository;
pub use store::CreditStore;
