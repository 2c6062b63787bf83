pub mod batch_persister;
pub mod database;
pub mod location_store;

pub use batch_persister::BatchPersister;
pub use database::DatabaseService;
pub use location_store::LocationStore;
