pub mod chat_store;
pub mod domain;
pub mod schema;

pub use chat_store::ChatStore;
