//! State machine module.

pub mod machine;

pub use machine::{
    Completion, Operation, OperationKind, PendingRequest, Request, SessionError, Step,
    TransferMachine, TransferState, TransferSummary,
};
