//! Source tables watched by the realtime sync
//!
//! Every conversation thread is observed through two tables: one holding a
//! row per named section (entity-scoped) and one holding a single long-form
//! document (document-scoped).

use std::fmt;

use serde::{Deserialize, Serialize};

/// Which of the two watched tables a subscription or event belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelKind {
    /// One row per section of a thread
    Entity,
    /// One long-form document per thread
    Document,
}

impl ChannelKind {
    /// Both channel kinds, in subscription order
    pub const ALL: [ChannelKind; 2] = [ChannelKind::Entity, ChannelKind::Document];
}

impl fmt::Display for ChannelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Entity => write!(f, "entity"),
            Self::Document => write!(f, "document"),
        }
    }
}

/// Table layout of the watched database
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableConfig {
    /// Database schema the tables live in
    pub schema: String,

    /// Table with one row per section
    pub entity_table: String,

    /// Table with one document row per thread
    pub document_table: String,

    /// Column used for the server-side subscription filter
    pub stream_column: String,
}

impl Default for TableConfig {
    fn default() -> Self {
        Self {
            schema: "public".to_string(),
            entity_table: "section_states".to_string(),
            document_table: "business_plans".to_string(),
            stream_column: "thread_id".to_string(),
        }
    }
}

impl TableConfig {
    /// Create the default table layout
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the schema
    pub fn with_schema(mut self, schema: impl Into<String>) -> Self {
        self.schema = schema.into();
        self
    }

    /// Set the entity table name
    pub fn with_entity_table(mut self, table: impl Into<String>) -> Self {
        self.entity_table = table.into();
        self
    }

    /// Set the document table name
    pub fn with_document_table(mut self, table: impl Into<String>) -> Self {
        self.document_table = table.into();
        self
    }

    /// Set the filter column
    pub fn with_stream_column(mut self, column: impl Into<String>) -> Self {
        self.stream_column = column.into();
        self
    }

    /// Table name for a channel kind
    pub fn table_for(&self, kind: ChannelKind) -> &str {
        match kind {
            ChannelKind::Entity => &self.entity_table,
            ChannelKind::Document => &self.document_table,
        }
    }

    /// Resolve a raw table name back to its channel kind
    pub fn kind_of(&self, table: &str) -> Option<ChannelKind> {
        if table == self.entity_table {
            Some(ChannelKind::Entity)
        } else if table == self.document_table {
            Some(ChannelKind::Document)
        } else {
            None
        }
    }

    /// Server-side filter expression for one thread (`<column>=eq.<key>`)
    pub fn stream_filter(&self, stream_key: &str) -> String {
        format!("{}=eq.{}", self.stream_column, stream_key)
    }

    /// Channel name for one table of one thread
    pub fn channel_name(&self, kind: ChannelKind, stream_key: &str) -> String {
        format!("{}:{}", self.table_for(kind), stream_key)
    }
}
