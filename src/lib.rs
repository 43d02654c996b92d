pub mod config;
pub mod schema;
pub mod source;
pub mod view;

pub use config::{ConfigError, SchemaType, TableViewConfig};
pub use schema::{BytesDecoder, DecodeError, JsonDecoder, StringDecoder, TableValue, ValueDecoder};
pub use source::{
    partition_name, InMemoryTopicClient, PartitionId, PartitionReader, ReaderOptions, Record,
    TopicClient,
};
pub use view::{ListenerError, ReconcileError, ReconcileReport, TableView, TableViewError};
