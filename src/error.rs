use thiserror::Error;

use crate::bus::{ClientId, MessageKind, SendStatus};
use crate::scheduler::{OperatorIndex, QueryId};

/// Errors surfaced by the scheduler core.
///
/// Every variant signals either a protocol violation or a broken bus. The
/// distributed state can no longer be trusted after one of these, so the
/// Foreman loop returns the error instead of continuing.
#[derive(Error, Debug)]
pub enum SchedulerError {
    #[error("message for unknown query {0}")]
    UnknownQuery(QueryId),

    #[error("operator index {operator_index} out of range for query {query_id}")]
    OperatorIndexOutOfRange {
        query_id: QueryId,
        operator_index: OperatorIndex,
    },

    #[error("unexpected {kind:?} message from client {sender}")]
    UnexpectedMessage { kind: MessageKind, sender: ClientId },

    #[error("completion or rebuild response for operator {operator_index} of query {query_id} with nothing outstanding")]
    SpuriousCompletion {
        query_id: QueryId,
        operator_index: OperatorIndex,
    },

    #[error("shiftboss index {0} not present in the directory")]
    UnknownShiftboss(usize),

    #[error("work received before registration was acknowledged")]
    NotYetRegistered,

    #[error("queued work-order count for shiftboss {0} went below zero")]
    QueuedCountUnderflow(usize),

    #[error("send of {kind:?} from {from} to {to} failed: {status:?}")]
    SendFailed {
        kind: MessageKind,
        from: ClientId,
        to: ClientId,
        status: SendStatus,
    },

    #[error("message bus closed while the foreman was still running")]
    BusClosed,
}

pub type Result<T> = std::result::Result<T, SchedulerError>;
