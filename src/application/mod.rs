// Application layer: use cases over the repository, blob store and change feed.

pub mod chat;
pub mod error;
pub mod service;
pub mod session;

pub use chat::*;
pub use error::*;
pub use service::*;
pub use session::*;
