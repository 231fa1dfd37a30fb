pub mod buffer;
pub mod conn;
pub mod epoll;
pub mod error;
pub mod logging;
pub mod pool;
pub mod queue;
pub mod request;
pub mod response;
pub mod server;
pub mod store;
pub mod syscalls;
pub mod timer;

// Re-exports for users
pub use buffer::Buffer;
pub use error::{Error, Result};
pub use logging::init_logging;
pub use server::{Config, Server};
pub use store::{MemoryStore, UserStore};
