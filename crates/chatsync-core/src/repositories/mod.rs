pub mod error;
pub mod http_remote_store;
pub mod in_memory_local_store;
pub mod in_memory_remote_store;
pub mod local_store;
pub mod remote_store;
pub mod sqlite_local_store;

pub use error::{RepositoryError, RepositoryResult};
pub use http_remote_store::HttpRemoteStore;
pub use in_memory_local_store::InMemoryLocalStore;
pub use in_memory_remote_store::InMemoryRemoteStore;
pub use local_store::{BoxFuture, LocalStore};
pub use remote_store::{Page, RemoteStore};
pub use sqlite_local_store::SqliteLocalStore;
