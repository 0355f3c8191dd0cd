pub mod chat_service;
pub mod envelope;

pub use chat_service::ChatService;
pub use envelope::Envelope;
