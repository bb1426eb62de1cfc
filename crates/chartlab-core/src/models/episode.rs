//! Episodes, notes and sections: the imported clinical text.

use serde::{Deserialize, Serialize};

use super::ids::{EpisodeId, NoteId, SectionId, StrategyId};

/// One hospital stay or encounter window for a patient.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Episode {
    pub id: EpisodeId,
    /// External patient identifier
    pub patient_id: String,
    /// Episode start (RFC 3339)
    pub start_at: String,
    pub admit_encounter_id: Option<String>,
    pub discharge_encounter_id: Option<String>,
    /// Import timestamp
    pub created_at: String,
}

/// Episode fields supplied at import time.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NewEpisode {
    pub patient_id: String,
    pub start_at: String,
    pub admit_encounter_id: Option<String>,
    pub discharge_encounter_id: Option<String>,
}

impl NewEpisode {
    /// Create an episode starting now.
    pub fn new(patient_id: impl Into<String>) -> Self {
        Self {
            patient_id: patient_id.into(),
            start_at: chrono::Utc::now().to_rfc3339(),
            admit_encounter_id: None,
            discharge_encounter_id: None,
        }
    }
}

/// A clinical note. Never mutated after import.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Note {
    pub id: NoteId,
    /// Owning episode
    pub episode_id: EpisodeId,
    /// External note identifier, globally unique
    pub note_ref: String,
    pub encounter_id: Option<String>,
    pub author: Option<String>,
    /// Authoring service (e.g., "Medicine")
    pub service: Option<String>,
    /// Note type (e.g., "H&P", "Progress Note")
    pub note_type: Option<String>,
    pub created_at: Option<String>,
    pub filed_at: Option<String>,
    pub last_modified_at: Option<String>,
    /// Full note text
    pub note_text: String,
}

/// Note fields supplied at import time.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NewNote {
    pub episode_id: EpisodeId,
    pub note_ref: String,
    pub encounter_id: Option<String>,
    pub author: Option<String>,
    pub service: Option<String>,
    pub note_type: Option<String>,
    pub created_at: Option<String>,
    pub filed_at: Option<String>,
    pub last_modified_at: Option<String>,
    pub note_text: String,
}

impl NewNote {
    /// Create a note with only the required fields.
    pub fn new(episode_id: EpisodeId, note_ref: impl Into<String>, note_text: impl Into<String>) -> Self {
        Self {
            episode_id,
            note_ref: note_ref.into(),
            encounter_id: None,
            author: None,
            service: None,
            note_type: None,
            created_at: None,
            filed_at: None,
            last_modified_at: None,
            note_text: note_text.into(),
        }
    }
}

/// A named span of a note produced by a segmentation strategy.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Section {
    pub id: SectionId,
    pub note_id: NoteId,
    /// Section name (e.g., "hpi_short")
    pub section_name: String,
    pub section_text: String,
    /// Segmentation strategy that produced this section
    pub strategy_id: StrategyId,
    pub updated_at: String,
}

/// The text a strategy runs over: a whole note or one of its sections.
#[derive(Debug, Clone, PartialEq)]
pub enum InputUnit {
    Note {
        note_id: NoteId,
        text: String,
    },
    Section {
        note_id: NoteId,
        section_id: SectionId,
        section_name: String,
        text: String,
    },
}

impl InputUnit {
    pub fn from_note(note: &Note) -> Self {
        InputUnit::Note {
            note_id: note.id,
            text: note.note_text.clone(),
        }
    }

    pub fn from_section(section: &Section) -> Self {
        InputUnit::Section {
            note_id: section.note_id,
            section_id: section.id,
            section_name: section.section_name.clone(),
            text: section.section_text.clone(),
        }
    }

    /// Note the unit belongs to.
    pub fn note_id(&self) -> NoteId {
        match self {
            InputUnit::Note { note_id, .. } | InputUnit::Section { note_id, .. } => *note_id,
        }
    }

    pub fn section_id(&self) -> Option<SectionId> {
        match self {
            InputUnit::Note { .. } => None,
            InputUnit::Section { section_id, .. } => Some(*section_id),
        }
    }

    pub fn text(&self) -> &str {
        match self {
            InputUnit::Note { text, .. } | InputUnit::Section { text, .. } => text,
        }
    }

    /// Unit kind, used in cache keys.
    pub fn kind(&self) -> &'static str {
        match self {
            InputUnit::Note { .. } => "note",
            InputUnit::Section { .. } => "section",
        }
    }

    /// Row id of the note or section.
    pub fn unit_id(&self) -> i64 {
        match self {
            InputUnit::Note { note_id, .. } => note_id.0,
            InputUnit::Section { section_id, .. } => section_id.0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_input_unit_accessors() {
        let section = Section {
            id: SectionId(9),
            note_id: NoteId(4),
            section_name: "hpi_short".into(),
            section_text: "Fever for two days".into(),
            strategy_id: StrategyId(1),
            updated_at: "2024-01-01T00:00:00+00:00".into(),
        };
        let unit = InputUnit::from_section(&section);
        assert_eq!(unit.note_id(), NoteId(4));
        assert_eq!(unit.section_id(), Some(SectionId(9)));
        assert_eq!(unit.unit_id(), 9);
        assert_eq!(unit.kind(), "section");
        assert_eq!(unit.text(), "Fever for two days");
    }

    #[test]
    fn test_new_episode_starts_now() {
        let episode = NewEpisode::new("MRN001");
        assert_eq!(episode.patient_id, "MRN001");
        assert!(chrono::DateTime::parse_from_rfc3339(&episode.start_at).is_ok());
    }
}
