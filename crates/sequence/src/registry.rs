//! Sequence Definition Registry: immutable, content-addressed versions.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use outreach_core::event_bus::{make_event, noop_sink, EventSink};
use outreach_core::types::EngineEventType;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::info;
use utoipa::ToSchema;
use uuid::Uuid;

use crate::calendar::parse_timezone;
use crate::error::DefinitionError;
use crate::types::{
    ConditionAction, SequenceDefinition, SequenceDraft, SequenceVersionId, Step, StepKind,
};

/// Operator-controlled flags on a version. Never part of the definition itself.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct VersionFlags {
    pub paused: bool,
    pub archived: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct VersionSummary {
    pub sequence_id: Uuid,
    pub version: u32,
    pub name: String,
    pub digest: String,
    pub step_count: usize,
    pub published_at: DateTime<Utc>,
    pub latest: bool,
    pub paused: bool,
    pub archived: bool,
}

#[derive(Debug, Clone)]
pub struct PublishOutcome {
    pub definition: Arc<SequenceDefinition>,
    /// False when the draft matched the latest version's content.
    pub created: bool,
}

/// Serializable registry contents.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RegistrySnapshot {
    pub definitions: Vec<SequenceDefinition>,
    pub flags: Vec<(SequenceVersionId, VersionFlags)>,
}

pub struct SequenceRegistry {
    definitions: DashMap<SequenceVersionId, Arc<SequenceDefinition>>,
    flags: DashMap<SequenceVersionId, VersionFlags>,
    /// Latest published version per sequence family.
    latest: DashMap<Uuid, u32>,
    event_sink: Arc<dyn EventSink>,
}

impl std::fmt::Debug for SequenceRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SequenceRegistry")
            .field("sequences", &self.latest.len())
            .field("versions", &self.definitions.len())
            .finish()
    }
}

impl SequenceRegistry {
    pub fn new() -> Self {
        Self {
            definitions: DashMap::new(),
            flags: DashMap::new(),
            latest: DashMap::new(),
            event_sink: noop_sink(),
        }
    }

    pub fn with_event_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.event_sink = sink;
        self
    }

    /// Validate and publish a draft. Content identical to the latest version
    /// returns that version instead of minting a new one.
    pub fn publish(
        &self,
        draft: SequenceDraft,
        now: DateTime<Utc>,
    ) -> Result<PublishOutcome, DefinitionError> {
        validate(&draft)?;
        let digest = content_digest(&draft);
        let sequence_id = draft.sequence_id.unwrap_or_else(Uuid::new_v4);

        // The family entry serializes concurrent publishes of one sequence.
        let mut latest = match (draft.sequence_id, self.latest.entry(sequence_id)) {
            (Some(_), dashmap::mapref::entry::Entry::Vacant(_)) => {
                return Err(DefinitionError::UnknownSequence(sequence_id));
            }
            (_, entry) => entry.or_insert(0),
        };

        if *latest > 0 {
            let current = SequenceVersionId::new(sequence_id, *latest);
            if let Some(existing) = self.definitions.get(&current) {
                if existing.digest == digest {
                    return Ok(PublishOutcome {
                        definition: existing.clone(),
                        created: false,
                    });
                }
            }
        }

        let version = *latest + 1;
        let definition = Arc::new(SequenceDefinition {
            id: sequence_id,
            version,
            name: draft.name,
            description: draft.description,
            steps: draft.steps,
            settings: draft.settings,
            digest,
            published_at: now,
        });
        let version_id = definition.version_id();
        self.definitions.insert(version_id, definition.clone());
        self.flags.insert(version_id, VersionFlags::default());
        *latest = version;
        drop(latest);

        info!(
            sequence_id = %sequence_id,
            version,
            name = %definition.name,
            steps = definition.steps.len(),
            "Published sequence version"
        );
        metrics::counter!("registry.published").increment(1);
        self.event_sink.emit(
            make_event(EngineEventType::SequencePublished, Uuid::nil(), None, None)
                .with_sequence(sequence_id, version),
        );

        Ok(PublishOutcome {
            definition,
            created: true,
        })
    }

    pub fn get(&self, version: &SequenceVersionId) -> Option<Arc<SequenceDefinition>> {
        self.definitions.get(version).map(|d| d.clone())
    }

    pub fn latest_version(&self, sequence_id: &Uuid) -> Option<SequenceVersionId> {
        self.latest
            .get(sequence_id)
            .map(|v| SequenceVersionId::new(*sequence_id, *v))
    }

    pub fn latest(&self, sequence_id: &Uuid) -> Option<Arc<SequenceDefinition>> {
        self.latest_version(sequence_id).and_then(|v| self.get(&v))
    }

    pub fn contains(&self, sequence_id: &Uuid) -> bool {
        self.latest.contains_key(sequence_id)
    }

    /// All versions of a sequence, oldest first.
    pub fn versions(&self, sequence_id: &Uuid) -> Vec<VersionSummary> {
        let latest = self.latest.get(sequence_id).map(|v| *v).unwrap_or(0);
        let mut versions: Vec<VersionSummary> = self
            .definitions
            .iter()
            .filter(|d| d.key().sequence_id == *sequence_id)
            .map(|d| {
                let flags = self.flags(d.key());
                VersionSummary {
                    sequence_id: *sequence_id,
                    version: d.version,
                    name: d.name.clone(),
                    digest: d.digest.clone(),
                    step_count: d.steps.len(),
                    published_at: d.published_at,
                    latest: d.version == latest,
                    paused: flags.paused,
                    archived: flags.archived,
                }
            })
            .collect();
        versions.sort_by_key(|v| v.version);
        versions
    }

    /// Latest definition of every sequence.
    pub fn list(&self) -> Vec<Arc<SequenceDefinition>> {
        let ids: Vec<Uuid> = self.latest.iter().map(|e| *e.key()).collect();
        ids.iter().filter_map(|id| self.latest(id)).collect()
    }

    pub fn flags(&self, version: &SequenceVersionId) -> VersionFlags {
        self.flags.get(version).map(|f| *f).unwrap_or_default()
    }

    pub fn is_paused(&self, version: &SequenceVersionId) -> bool {
        self.flags(version).paused
    }

    /// Pause every version of a sequence. Returns the number of versions touched.
    pub fn pause_sequence(&self, sequence_id: &Uuid) -> Result<usize, DefinitionError> {
        self.set_paused(sequence_id, true)
    }

    pub fn resume_sequence(&self, sequence_id: &Uuid) -> Result<usize, DefinitionError> {
        self.set_paused(sequence_id, false)
    }

    fn set_paused(&self, sequence_id: &Uuid, paused: bool) -> Result<usize, DefinitionError> {
        if !self.contains(sequence_id) {
            return Err(DefinitionError::UnknownSequence(*sequence_id));
        }
        let mut touched = 0;
        for mut entry in self
            .flags
            .iter_mut()
            .filter(|f| f.key().sequence_id == *sequence_id)
        {
            entry.paused = paused;
            touched += 1;
        }
        info!(sequence_id = %sequence_id, paused, versions = touched, "Updated sequence pause flag");
        Ok(touched)
    }

    /// Mark versions archived when they are superseded and nothing is pinned
    /// to them. Archived versions stay readable.
    pub fn archive_unpinned(&self, pinned: &HashSet<SequenceVersionId>) -> Vec<SequenceVersionId> {
        // Copied first: publish locks `latest` before `flags`.
        let latest: HashSet<SequenceVersionId> = self
            .latest
            .iter()
            .map(|e| SequenceVersionId::new(*e.key(), *e.value()))
            .collect();
        let mut archived = Vec::new();
        for mut entry in self.flags.iter_mut() {
            let version = *entry.key();
            if entry.archived || pinned.contains(&version) || latest.contains(&version) {
                continue;
            }
            entry.archived = true;
            archived.push(version);
        }
        for version in &archived {
            info!(sequence = %version, "Archived idle sequence version");
            self.event_sink.emit(
                make_event(EngineEventType::SequenceArchived, Uuid::nil(), None, None)
                    .with_sequence(version.sequence_id, version.version),
            );
        }
        archived
    }

    pub fn export(&self) -> RegistrySnapshot {
        RegistrySnapshot {
            definitions: self.definitions.iter().map(|d| (**d).clone()).collect(),
            flags: self.flags.iter().map(|f| (*f.key(), *f.value())).collect(),
        }
    }

    pub fn import(&self, snapshot: RegistrySnapshot) {
        self.definitions.clear();
        self.flags.clear();
        self.latest.clear();
        for definition in snapshot.definitions {
            let version_id = definition.version_id();
            let mut latest = self.latest.entry(definition.id).or_insert(0);
            *latest = (*latest).max(definition.version);
            drop(latest);
            self.flags.insert(version_id, VersionFlags::default());
            self.definitions.insert(version_id, Arc::new(definition));
        }
        for (version, flags) in snapshot.flags {
            if self.definitions.contains_key(&version) {
                self.flags.insert(version, flags);
            }
        }
    }
}

impl Default for SequenceRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Hex SHA-256 of the draft's content. Identity fields are excluded.
pub fn content_digest(draft: &SequenceDraft) -> String {
    #[derive(Serialize)]
    struct Content<'a> {
        name: &'a str,
        description: &'a Option<String>,
        steps: &'a [Step],
        settings: &'a crate::types::SequenceSettings,
    }
    let content = Content {
        name: &draft.name,
        description: &draft.description,
        steps: &draft.steps,
        settings: &draft.settings,
    };
    let bytes = serde_json::to_vec(&content).unwrap_or_default();
    hex::encode(Sha256::digest(&bytes))
}

/// Publish-time checks. Anything rejected here can never reach a running enrollee.
pub fn validate(draft: &SequenceDraft) -> Result<(), DefinitionError> {
    if draft.name.trim().is_empty() {
        return Err(DefinitionError::EmptyName);
    }
    if draft.steps.is_empty() {
        return Err(DefinitionError::NoSteps);
    }
    for (index, step) in draft.steps.iter().enumerate() {
        let expected = index as u32 + 1;
        if step.step_number != expected {
            return Err(DefinitionError::StepNumbering {
                expected,
                found: step.step_number,
            });
        }
    }
    if !draft.steps.iter().any(|s| s.active) {
        return Err(DefinitionError::NoActiveSteps);
    }

    let last = draft.steps.len() as u32;
    for step in &draft.steps {
        for condition in &step.conditions {
            if let ConditionAction::SkipTo { step: target } = condition.action {
                if target == 0 || target > last {
                    return Err(DefinitionError::SkipTargetMissing {
                        step: step.step_number,
                        target,
                    });
                }
                // A wait re-evaluates the same window, so jumping onto itself never ends.
                let self_loop = step.kind == StepKind::Wait && target == step.step_number;
                if target < step.step_number || self_loop {
                    return Err(DefinitionError::BackwardSkip {
                        step: step.step_number,
                        target,
                    });
                }
            }
        }
        if let Some(tz) = &step.timezone {
            if parse_timezone(tz).is_none() {
                return Err(DefinitionError::UnknownTimezone(tz.clone()));
            }
        }
    }

    let schedule = &draft.settings.sending_schedule;
    if parse_timezone(&schedule.timezone).is_none() {
        return Err(DefinitionError::UnknownTimezone(schedule.timezone.clone()));
    }
    for (day, ranges) in schedule.days() {
        for range in ranges {
            if range.start >= range.end {
                return Err(DefinitionError::InvalidTimeRange {
                    day: day.to_string(),
                    start: range.start.to_string(),
                    end: range.end.to_string(),
                });
            }
        }
    }

    let has_window = schedule.days().iter().any(|(_, r)| !r.is_empty());
    let has_weekday_window = schedule
        .days()
        .iter()
        .any(|(day, r)| !r.is_empty() && !matches!(day, chrono::Weekday::Sat | chrono::Weekday::Sun));
    for step in draft.steps.iter().filter(|s| s.active && s.kind.is_window_gated()) {
        let usable = if step.skip_weekends {
            has_weekday_window
        } else {
            has_window
        };
        if !usable {
            return Err(DefinitionError::NoSendingWindow {
                step: step.step_number,
            });
        }
    }
    Ok(())
}
