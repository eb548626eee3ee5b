//! Credit accounting: atomic debit, idempotent refund, transaction log.

pub mod ledger;

pub use ledger::{
    CreditError, CreditLedger, CreditTransaction, InMemoryCreditLedger, TransactionKind,
};
