//! Pipeline services: classification, card locking, source fetches,
//! extraction, dispatch, and retry.

pub mod card_locks;
pub mod classifier;
pub mod dispatcher;
pub mod extractor;
pub mod retry_worker;
pub mod source_client;

pub use card_locks::CardLocks;
pub use classifier::ChangeClass;
pub use dispatcher::{Dispatcher, Notification, Outcome};
pub use extractor::{ExtractError, Extraction, Extractor, LlmExtractor};
pub use retry_worker::RetryWorker;
pub use source_client::{BoardClient, CardSource, SourceError};
