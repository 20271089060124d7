pub mod chat;
pub mod envelope;
pub mod error;
pub mod mock;

pub use chat::ChatClient;
pub use envelope::{result_envelope, ChatResponse, ERROR_KEY};
pub use error::GatewayError;
pub use mock::{MockBackend, MockReply, SharedScript};
