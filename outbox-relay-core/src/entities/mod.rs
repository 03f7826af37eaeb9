pub mod outbox_event;

pub use outbox_event::{
    DeleteProcessedEvents, InvalidTableName, OutboxEvent, OutboxTable, PollUnprocessedEvents,
};
