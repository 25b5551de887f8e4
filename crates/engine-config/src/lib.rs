pub mod error;
pub mod loader;
pub mod model;
pub mod notifier;

pub use error::ConfigError;
pub use loader::{config_template, load_config, load_config_from_str};
pub use model::{
    ConnectionConfig, ConverterKind, FieldMapping, MysqlConnection, OracleConnection, RetryPolicy,
    SourceConfig, SyncConfig, TableMapping, TargetConfig, TargetKind,
};
pub use notifier::{ConsoleNotifier, Notifier, NotifierRegistry, NotifyLevel, WebhookNotifier};
