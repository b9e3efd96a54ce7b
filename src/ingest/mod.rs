pub mod backfill;
pub mod live;
pub mod universe;

pub use backfill::BackfillEngine;
pub use live::LiveStreamConsumer;
