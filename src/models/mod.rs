mod connection;
mod id;
mod transaction;
mod user;

pub use connection::{BankConnection, ConnectionStatus, StatusTransitionError};
pub use id::{Id, IdError};
pub use transaction::{BalancePrecision, Transaction, TransactionType, UNKNOWN_CURRENCY};
pub use user::User;
