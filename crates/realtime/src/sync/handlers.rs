//! Per-event-type checkpoint mutations
//!
//! A handler turns one event into edits of the checkpoint's channel values
//! and reports which channels it touched. Handlers are pure and may run
//! more than once for the same event when a conditional write is retried.

use std::collections::{BTreeMap, HashSet};
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::content::{to_rich_document, RichDocument};
use super::error::SyncError;
use crate::event::{aliases, Event};

/// Channel holding one record per section
pub const SECTION_STATES_CHANNEL: &str = "section_states";

/// Channel holding the long-form business plan
pub const BUSINESS_PLAN_CHANNEL: &str = "business_plan";

/// Applies one kind of event to checkpoint channel values
pub trait SyncHandler: Send + Sync {
    /// Mutate `values` and return the names of the channels changed
    fn apply(
        &self,
        event: &Event,
        values: &mut BTreeMap<String, Value>,
    ) -> Result<Vec<String>, SyncError>;
}

/// Lifecycle of a section
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SectionStatus {
    Pending,
    InProgress,
    Done,
}

impl SectionStatus {
    /// Parse a stored status string
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "pending" => Some(Self::Pending),
            "in_progress" => Some(Self::InProgress),
            "done" => Some(Self::Done),
            _ => None,
        }
    }
}

impl fmt::Display for SectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::InProgress => write!(f, "in_progress"),
            Self::Done => write!(f, "done"),
        }
    }
}

/// Section body in both rich and plain form
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SectionContent {
    pub content: RichDocument,
    pub plain_text: String,
}

/// One entry of the section collection
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SectionState {
    pub section_id: String,
    pub content: SectionContent,
    pub status: SectionStatus,

    #[serde(default)]
    pub satisfaction_status: Option<String>,
}

/// Writes entity changes into the section collection
#[derive(Debug, Clone)]
pub struct SectionStateHandler {
    channel: String,
    known_sections: Option<HashSet<String>>,
}

impl SectionStateHandler {
    /// Handler writing to [`SECTION_STATES_CHANNEL`], accepting any section
    pub fn new() -> Self {
        Self {
            channel: SECTION_STATES_CHANNEL.to_string(),
            known_sections: None,
        }
    }

    /// Write to another channel
    pub fn with_channel(mut self, channel: impl Into<String>) -> Self {
        self.channel = channel.into();
        self
    }

    /// Reject sections outside this catalog
    pub fn with_known_sections<I, S>(mut self, sections: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.known_sections = Some(sections.into_iter().map(Into::into).collect());
        self
    }

    /// Status for the updated row
    ///
    /// An explicit status wins (unknown values count as in progress). A row
    /// that advanced the conversation is done. Otherwise the previous status
    /// is kept, defaulting to in progress.
    pub fn derive_status(row: &Map<String, Value>, previous: Option<SectionStatus>) -> SectionStatus {
        if let Some(raw) = aliases::first_str(row, aliases::STATUS) {
            return SectionStatus::parse(raw).unwrap_or(SectionStatus::InProgress);
        }

        let advanced = aliases::first_str(row, aliases::DIRECTIVE)
            .is_some_and(|directive| directive.eq_ignore_ascii_case("next"))
            || aliases::first_bool(row, aliases::SATISFIED) == Some(true);
        if advanced {
            return SectionStatus::Done;
        }

        previous.unwrap_or(SectionStatus::InProgress)
    }
}

impl Default for SectionStateHandler {
    fn default() -> Self {
        Self::new()
    }
}

impl SyncHandler for SectionStateHandler {
    fn apply(
        &self,
        event: &Event,
        values: &mut BTreeMap<String, Value>,
    ) -> Result<Vec<String>, SyncError> {
        let section_id = event
            .entity_id
            .as_deref()
            .filter(|id| !id.trim().is_empty())
            .ok_or_else(|| SyncError::MissingEntity {
                event_id: event.event_id.clone(),
            })?;

        if let Some(known) = &self.known_sections {
            if !known.contains(section_id) {
                return Err(SyncError::UnknownEntity(section_id.to_string()));
            }
        }

        let row = &event.payload.new;
        let raw = aliases::first_present(row, aliases::ENTITY_CONTENT).ok_or_else(|| {
            SyncError::MissingContent {
                event_id: event.event_id.clone(),
            }
        })?;
        let document = to_rich_document(raw)?;

        let collection = values
            .entry(self.channel.clone())
            .or_insert_with(|| Value::Object(Map::new()));
        if collection.is_null() {
            *collection = Value::Object(Map::new());
        }
        let Value::Object(sections) = collection else {
            return Err(SyncError::UnexpectedShape {
                channel: self.channel.clone(),
                reason: "expected an object keyed by section id".to_string(),
            });
        };

        let previous = sections
            .get(section_id)
            .and_then(|entry| entry.get("status"))
            .and_then(Value::as_str)
            .and_then(SectionStatus::parse);

        let state = SectionState {
            section_id: section_id.to_string(),
            content: SectionContent {
                plain_text: document.plain_text(),
                content: document,
            },
            status: Self::derive_status(row, previous),
            satisfaction_status: aliases::first_str(row, aliases::SATISFACTION_STATUS)
                .map(str::to_string),
        };

        let entry = serde_json::to_value(&state).map_err(|e| SyncError::UnexpectedShape {
            channel: self.channel.clone(),
            reason: e.to_string(),
        })?;
        sections.insert(section_id.to_string(), entry);

        Ok(vec![self.channel.clone()])
    }
}

/// Overwrites the long-form document channel
#[derive(Debug, Clone)]
pub struct BusinessPlanHandler {
    channel: String,
}

impl BusinessPlanHandler {
    /// Handler writing to [`BUSINESS_PLAN_CHANNEL`]
    pub fn new() -> Self {
        Self {
            channel: BUSINESS_PLAN_CHANNEL.to_string(),
        }
    }

    /// Write to another channel
    pub fn with_channel(mut self, channel: impl Into<String>) -> Self {
        self.channel = channel.into();
        self
    }
}

impl Default for BusinessPlanHandler {
    fn default() -> Self {
        Self::new()
    }
}

impl SyncHandler for BusinessPlanHandler {
    fn apply(
        &self,
        event: &Event,
        values: &mut BTreeMap<String, Value>,
    ) -> Result<Vec<String>, SyncError> {
        let content = aliases::first_present(&event.payload.new, aliases::DOCUMENT_CONTENT)
            .ok_or_else(|| SyncError::MissingContent {
                event_id: event.event_id.clone(),
            })?;

        values.insert(self.channel.clone(), content.clone());
        Ok(vec![self.channel.clone()])
    }
}
