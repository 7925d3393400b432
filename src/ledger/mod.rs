pub mod engine;
pub mod memory;
pub mod models;
pub mod repository;
pub mod store;

pub use engine::{AuditReport, LedgerEntry, TokenLedger};
pub use memory::InMemoryLedgerStore;
pub use repository::LedgerRepository;
pub use store::{LedgerStore, LedgerTx};
