//! Table descriptors and message-table options.

use std::time::Duration;

use crate::config::{MessagerConfig, TableConfig};
use crate::error::{MessagerError, Result};
use crate::types::{Field, FieldType};

/// Marker that flags a table comment as a message table.
pub const MESSAGE_COMMENT_MARKER: &str = "vitess_message";

pub const COL_ID: &str = "id";
pub const COL_PRIORITY: &str = "priority";
pub const COL_TIME_NEXT: &str = "time_next";
pub const COL_EPOCH: &str = "epoch";
pub const COL_TIME_ACKED: &str = "time_acked";

/// Bookkeeping columns every message table must carry besides `id`.
pub const META_COLUMNS: [&str; 4] = [COL_PRIORITY, COL_TIME_NEXT, COL_EPOCH, COL_TIME_ACKED];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnDef {
    pub name: String,
    pub field_type: FieldType,
}

impl ColumnDef {
    pub fn new(name: impl Into<String>, field_type: FieldType) -> Self {
        Self {
            name: name.into(),
            field_type,
        }
    }
}

/// Per-table message options. Unset values fall back to [`MessagerConfig`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MessageSettings {
    pub ack_wait: Option<Duration>,
    pub purge_after: Option<Duration>,
    pub batch_size: Option<usize>,
    pub cache_size: Option<usize>,
    pub poller_interval: Option<Duration>,
    pub min_backoff: Option<Duration>,
    pub max_backoff: Option<Duration>,
    pub max_epoch: Option<i64>,
}

impl MessageSettings {
    /// Parse a table comment such as
    /// `vitess_message,vt_ack_wait=30,vt_purge_after=120,vt_batch_size=1`.
    ///
    /// Returns `Ok(None)` when the comment does not mark a message table.
    /// Durations are whole seconds.
    pub fn parse_comment(comment: &str) -> Result<Option<Self>> {
        let mut parts = comment.split(',').map(str::trim).filter(|p| !p.is_empty());
        if parts.next() != Some(MESSAGE_COMMENT_MARKER) {
            return Ok(None);
        }

        let mut settings = MessageSettings::default();
        for part in parts {
            let (key, value) = part.split_once('=').ok_or_else(|| {
                MessagerError::InvalidArgument(format!("malformed message option: {}", part))
            })?;
            let value = value.trim();
            match key.trim() {
                "vt_ack_wait" => settings.ack_wait = Some(parse_seconds(key, value)?),
                "vt_purge_after" => settings.purge_after = Some(parse_seconds(key, value)?),
                "vt_poller_interval" => {
                    settings.poller_interval = Some(parse_seconds(key, value)?)
                }
                "vt_min_backoff" => settings.min_backoff = Some(parse_seconds(key, value)?),
                "vt_max_backoff" => settings.max_backoff = Some(parse_seconds(key, value)?),
                "vt_batch_size" => settings.batch_size = Some(parse_number(key, value)?),
                "vt_cache_size" => settings.cache_size = Some(parse_number(key, value)?),
                "vt_max_epoch" => settings.max_epoch = Some(parse_number(key, value)?),
                other => {
                    return Err(MessagerError::InvalidArgument(format!(
                        "unknown message option: {}",
                        other
                    )))
                }
            }
        }

        Ok(Some(settings))
    }
}

fn parse_number<T: std::str::FromStr>(key: &str, value: &str) -> Result<T> {
    value.parse().map_err(|_| {
        MessagerError::InvalidArgument(format!("invalid value for {}: {}", key, value))
    })
}

fn parse_seconds(key: &str, value: &str) -> Result<Duration> {
    parse_number::<u64>(key, value).map(Duration::from_secs)
}

/// Schema metadata for one table as delivered by the schema feed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableDescriptor {
    pub name: String,
    pub columns: Vec<ColumnDef>,
    /// Present iff the table is a message table
    pub message: Option<MessageSettings>,
}

impl TableDescriptor {
    /// A plain, non-message table.
    pub fn standard(name: impl Into<String>, columns: Vec<ColumnDef>) -> Self {
        Self {
            name: name.into(),
            columns,
            message: None,
        }
    }

    pub fn message(
        name: impl Into<String>,
        columns: Vec<ColumnDef>,
        settings: MessageSettings,
    ) -> Self {
        Self {
            name: name.into(),
            columns,
            message: Some(settings),
        }
    }

    /// Build a descriptor from a configuration entry. `id` and the meta
    /// columns are typed as BIGINT, everything else as bytes.
    pub fn from_config(table: &TableConfig) -> Result<Self> {
        let columns = table
            .columns
            .iter()
            .map(|name| {
                let field_type = if name == COL_ID || META_COLUMNS.contains(&name.as_str()) {
                    FieldType::Int64
                } else {
                    FieldType::Bytes
                };
                ColumnDef::new(name.clone(), field_type)
            })
            .collect();

        Ok(Self {
            name: table.name.clone(),
            columns,
            message: MessageSettings::parse_comment(&table.comment)?,
        })
    }

    pub fn is_message_table(&self) -> bool {
        self.message.is_some()
    }

    pub fn column(&self, name: &str) -> Option<&ColumnDef> {
        self.columns.iter().find(|c| c.name == name)
    }
}

/// Resolved message layout and policy for one table.
#[derive(Debug, Clone, PartialEq)]
pub struct MessageInfo {
    pub table: String,
    /// Columns delivered to receivers: `id` first, then the payload columns
    pub fields: Vec<Field>,
    pub ack_wait: Duration,
    pub purge_after: Duration,
    pub batch_size: usize,
    pub cache_size: usize,
    pub poller_interval: Duration,
    pub min_backoff: Duration,
    pub max_backoff: Duration,
    pub max_epoch: i64,
}

impl MessageInfo {
    /// Validate `descriptor` and merge its options over `defaults`.
    pub fn resolve(descriptor: &TableDescriptor, defaults: &MessagerConfig) -> Result<Self> {
        let settings = descriptor.message.as_ref().ok_or_else(|| {
            MessagerError::InvalidArgument(format!(
                "table {} is not a message table",
                descriptor.name
            ))
        })?;

        let id = descriptor.column(COL_ID).ok_or_else(|| missing(descriptor, COL_ID))?;
        for name in META_COLUMNS {
            if descriptor.column(name).is_none() {
                return Err(missing(descriptor, name));
            }
        }

        let mut fields = vec![Field::new(COL_ID, id.field_type)];
        fields.extend(
            descriptor
                .columns
                .iter()
                .filter(|c| c.name != COL_ID && !META_COLUMNS.contains(&c.name.as_str()))
                .map(|c| Field::new(c.name.clone(), c.field_type)),
        );

        let ack_wait = settings.ack_wait.unwrap_or_else(|| defaults.ack_wait());
        let min_backoff = settings.min_backoff.unwrap_or_else(|| {
            if defaults.min_backoff_ms == 0 {
                ack_wait
            } else {
                Duration::from_millis(defaults.min_backoff_ms)
            }
        });
        let max_backoff = settings.max_backoff.unwrap_or_else(|| {
            if defaults.max_backoff_ms == 0 {
                Duration::from_millis(defaults.backoff_cap_ms)
            } else {
                Duration::from_millis(defaults.max_backoff_ms)
            }
        });

        Ok(Self {
            table: descriptor.name.clone(),
            fields,
            ack_wait,
            purge_after: settings.purge_after.unwrap_or_else(|| defaults.purge_after()),
            batch_size: settings.batch_size.unwrap_or(defaults.batch_size).max(1),
            cache_size: settings.cache_size.unwrap_or(defaults.cache_size).max(1),
            poller_interval: settings
                .poller_interval
                .unwrap_or_else(|| defaults.poller_interval()),
            min_backoff,
            max_backoff: max_backoff.max(min_backoff),
            max_epoch: settings.max_epoch.unwrap_or(defaults.max_epoch),
        })
    }

    /// Names of the payload columns after `id`.
    pub fn payload_columns(&self) -> impl Iterator<Item = &str> {
        self.fields.iter().skip(1).map(|f| f.name.as_str())
    }
}

fn missing(descriptor: &TableDescriptor, column: &str) -> MessagerError {
    MessagerError::InvalidArgument(format!(
        "message table {} is missing required column {}",
        descriptor.name, column
    ))
}

/// Column layout shared by tests and the binary's defaults.
pub fn message_columns(payload: &[&str]) -> Vec<ColumnDef> {
    let mut columns = vec![
        ColumnDef::new(COL_ID, FieldType::Bytes),
        ColumnDef::new(COL_PRIORITY, FieldType::Int64),
        ColumnDef::new(COL_TIME_NEXT, FieldType::Int64),
        ColumnDef::new(COL_EPOCH, FieldType::Int64),
        ColumnDef::new(COL_TIME_ACKED, FieldType::Int64),
    ];
    columns.extend(payload.iter().map(|p| ColumnDef::new(*p, FieldType::Bytes)));
    columns
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCode;

    #[test]
    fn test_parse_comment() {
        let settings = MessageSettings::parse_comment(
            "vitess_message,vt_ack_wait=30,vt_purge_after=120,vt_batch_size=2,vt_max_epoch=5",
        )
        .unwrap()
        .unwrap();
        assert_eq!(settings.ack_wait, Some(Duration::from_secs(30)));
        assert_eq!(settings.purge_after, Some(Duration::from_secs(120)));
        assert_eq!(settings.batch_size, Some(2));
        assert_eq!(settings.max_epoch, Some(5));
        assert_eq!(settings.cache_size, None);
    }

    #[test]
    fn test_parse_comment_not_message() {
        assert_eq!(MessageSettings::parse_comment("").unwrap(), None);
        assert_eq!(MessageSettings::parse_comment("orders table").unwrap(), None);
    }

    #[test]
    fn test_parse_comment_rejects_bad_options() {
        let err = MessageSettings::parse_comment("vitess_message,vt_bogus=1").unwrap_err();
        assert_eq!(err.code(), ErrorCode::InvalidArgument);

        let err = MessageSettings::parse_comment("vitess_message,vt_ack_wait=abc").unwrap_err();
        assert_eq!(err.code(), ErrorCode::InvalidArgument);

        let err = MessageSettings::parse_comment("vitess_message,vt_ack_wait").unwrap_err();
        assert_eq!(err.code(), ErrorCode::InvalidArgument);
    }

    #[test]
    fn test_resolve_fields_and_defaults() {
        let descriptor =
            TableDescriptor::message("t1", message_columns(&["message"]), MessageSettings::default());
        let info = MessageInfo::resolve(&descriptor, &MessagerConfig::default()).unwrap();

        let names: Vec<_> = info.fields.iter().map(|f| f.name.as_str()).collect();
        assert_eq!(names, vec!["id", "message"]);
        assert_eq!(info.ack_wait, Duration::from_secs(30));
        // min backoff follows ack wait when unset
        assert_eq!(info.min_backoff, info.ack_wait);
        assert_eq!(info.max_backoff, Duration::from_secs(3600));
        assert_eq!(info.max_epoch, 0);
    }

    #[test]
    fn test_resolve_rejects_missing_columns() {
        let columns = vec![
            ColumnDef::new("id", FieldType::Int64),
            ColumnDef::new("priority", FieldType::Int64),
        ];
        let descriptor = TableDescriptor::message("t1", columns, MessageSettings::default());
        let err = MessageInfo::resolve(&descriptor, &MessagerConfig::default()).unwrap_err();
        assert_eq!(err.code(), ErrorCode::InvalidArgument);
        assert!(err.to_string().contains("time_next"));
    }

    #[test]
    fn test_from_config() {
        let table = TableConfig {
            name: "orders_queue".into(),
            columns: vec![
                "id".into(),
                "priority".into(),
                "time_next".into(),
                "epoch".into(),
                "time_acked".into(),
                "message".into(),
            ],
            comment: "vitess_message,vt_cache_size=10".into(),
        };
        let descriptor = TableDescriptor::from_config(&table).unwrap();
        assert!(descriptor.is_message_table());
        assert_eq!(
            descriptor.column("epoch").map(|c| c.field_type),
            Some(FieldType::Int64)
        );
        assert_eq!(
            descriptor.column("message").map(|c| c.field_type),
            Some(FieldType::Bytes)
        );

        let info = MessageInfo::resolve(&descriptor, &MessagerConfig::default()).unwrap();
        assert_eq!(info.fields[0], Field::new("id", FieldType::Int64));
        assert_eq!(
            descriptor.message.as_ref().and_then(|m| m.cache_size),
            Some(10)
        );
    }
}
