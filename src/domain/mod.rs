//! Domain module
//!
//! Core domain types and business logic.

pub mod amount;
pub mod error;
pub mod events;
pub mod transaction;

pub use amount::{Amount, AmountError};
pub use error::DomainError;
pub use events::{
    EventDecodeError, TransactionCreated, TransactionValidated, VerdictStatus,
    TRANSACTION_CREATED_V1, TRANSACTION_VALIDATED_V1,
};
pub use transaction::{StatusChange, Transaction, TransactionStatus};
