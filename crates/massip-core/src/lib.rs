#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::option_if_let_else)]

pub mod address;
pub mod config;
pub mod dispatcher;
pub mod entity;
pub mod error;
pub mod extract;
pub mod invoker;
pub mod parser;
pub mod plugin;
pub mod processor;
pub mod progress;
pub mod registry;
pub mod retry;
pub mod rows;
pub mod settings;

pub use config::{ConfigError, ConfigResult};
pub use dispatcher::{BatchDispatcher, BatchSummary, CancelFlag};
pub use entity::{Entity, Location};
pub use error::{Error, Result};
pub use extract::EntityExtractor;
pub use invoker::{Invocation, PluginInvoker};
pub use parser::{ParserDefinition, ParserSet};
pub use plugin::{
    CommandOutcome, CommandPlugin, EchoPlugin, Plugin, PluginCall, PluginError, PluginManifest,
    PluginMetadata, PluginOutput, PluginResult, RetryDeclaration,
};
pub use processor::{RowOutcome, RowProcessor};
pub use progress::{InvocationKind, ProgressEvent, ProgressSender};
pub use registry::{PluginRegistry, PluginSelection, Rejection};
pub use retry::{Attempt, EndpointSelector, RetryOutcome, RetryPolicy, RetrySettings};
pub use rows::{
    BatchIoError, CsvRowSink, CsvRowSource, RowRead, RowSink, RowSource, VecRowSink, VecRowSource,
};
pub use settings::Settings;
