//! Network clients for the two sinks.

pub mod elastic;
pub mod jetstream;

pub use elastic::ElasticSearchSink;
pub use jetstream::JetStreamSink;
