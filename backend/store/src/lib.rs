pub mod memory;
pub mod model;
pub mod postgres;
pub mod store;

pub use memory::MemStore;
pub use model::*;
pub use postgres::{PgStore, PgStoreConfig};
pub use store::*;
