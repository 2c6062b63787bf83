pub mod connection_manager;
pub mod connection_pool;
pub mod session;

pub use connection_manager::ConnectionManager;
pub use connection_pool::ConnectionPool;
pub use session::{Session, SessionState};
