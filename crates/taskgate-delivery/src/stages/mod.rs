//! The delivery stages, outermost first.

pub mod auth;
pub mod body;
pub mod containment;
pub mod logging;
pub mod mutex;
pub mod transaction;

pub use auth::AuthenticationStage;
pub use body::BodyParsingStage;
pub use containment::ExceptionContainmentStage;
pub use logging::LoggingStage;
pub use mutex::MutexSingleFlightStage;
pub use transaction::TransactionMarkerStage;
