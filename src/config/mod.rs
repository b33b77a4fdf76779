mod settings;

pub use settings::{
    AdminConfig, DatabaseConfig, LoggingConfig, MessagerConfig, Settings, TableConfig,
};
