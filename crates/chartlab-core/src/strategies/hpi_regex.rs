//! Regex segmentation of the short HPI.
//!
//! Finds the most likely start heading, then cuts at the first heading that usually
//! follows the HPI. Short HPIs aim for the first paragraph, so the end markers are
//! aggressive about trimming ED and hospital courses.

use chrono::NaiveDate;
use once_cell::sync::Lazy;
use regex::Regex;

use crate::strategy::{ExtractorError, SectionSegmenter};

/// Section name written by this segmenter.
pub const HPI_SHORT: &str = "hpi_short";

static HPI_START: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?xi)
        \b(
            HPI
            | (History|Central\x20Elements)\x20of\x20(the\x20)?(Present(ing)?\x20Illness|Traumatic\x20Injury)
            | Brief\x20summary
        )\b(
            # prefixes inside the HPI text that are cut away
            :
            | \s+Comments:\s*
            | \s+HPI\b
            | \s+History\x20of\x20(the\x20)?Present\x20Illness
            | \s+Chief\x20Complaint:[^\n]*
        )*
        ",
    )
    .expect("HPI start pattern")
});

static HPI_END: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?xi)
        (
            \n (
                # starts a line, exact punctuation
                History\x20reviewed.\x20+No\x20pertinent\x20past\x20medical\x20history.
            )
            | \n (
                # formatted as a heading: ends with a colon or newline
                Electronic\x20Medical\x20Records\x20Reviewed
                | History\x20provided\x20by
                | (E[DWR]|Emergency\x20(Department|Room))\x20Course
                | Current\x20Assessment
                | Historical\x20features
                | Focused\x20COVID\x20History
                | (ED\x20Triage\x20)? (Vitals|Vital\x20Signs)
                | (Plan|A[/&]P)
                | (Estimated\x20Date\x20of\x20Delivery|EDD)
                | (Relevant|Pertinent\x20)? (Home\x20)? Medications
                | (Relevant|Pertinent\x20)? (Physical\x20)? Exam
                | Quality\x20Bundle
            ) [:\n]
            | \n (
                # high confidence, any word boundary
                Review\x20of\x20Systems
                | ROS
                | Past\x20(Medical\x20)?(History|Hx)
                | Patient\x20Active\x20Problem\x20List
                | Medical (([/\s]+|\x20+(\band\b|&)\x20+)Surgical)? \x20(History|Hx)
                | PMH
                | (In\x20|On\x20arrival\x20(to|at)\x20) (the\x20)? (\w+\x20)?
                    (E[DWR]|Emergency\x20(Room|Department))
                | Data\x20reviewed
                | ((Impression|Assessment)\x20and\x20) Plan
            ) \b
        )
        ",
    )
    .expect("HPI end pattern")
});

static LEADING_JUNK: Lazy<Regex> = Lazy::new(|| Regex::new(r"\n[ ?]+").expect("leading junk pattern"));
static BLANK_LINES: Lazy<Regex> = Lazy::new(|| Regex::new(r"\n\n+").expect("blank lines pattern"));

/// Normalize exported note text: double spaces are line breaks in the source system.
pub fn clean_note_text(text: &str) -> String {
    let text = text.replace("  ", "\n");
    let text = LEADING_JUNK.replace_all(&text, "\n");
    let text = BLANK_LINES.replace_all(&text, "\n\n");
    text.trim().to_string()
}

/// The short HPI of a cleaned note, if a start heading is found.
pub fn extract_short_hpi(note_text: &str) -> Option<String> {
    let start = HPI_START.find(note_text)?;
    let rest = &note_text[start.end()..];
    let end = HPI_END.find(rest).map_or(rest.len(), |m| m.start());
    // \u{a0}: non-breaking space
    let hpi = rest[..end].trim_matches(|c| ":?-_ \u{a0}\n".contains(c));
    Some(hpi.to_string())
}

/// Segmenter producing a single `hpi_short` section.
#[derive(Debug, Default)]
pub struct HpiRegexSegmenter;

impl SectionSegmenter for HpiRegexSegmenter {
    fn segment(&self, text: &str) -> Result<Vec<(String, String)>, ExtractorError> {
        Ok(extract_short_hpi(&clean_note_text(text))
            .filter(|hpi| !hpi.is_empty())
            .map(|hpi| vec![(HPI_SHORT.to_string(), hpi)])
            .unwrap_or_default())
    }

    fn description(&self) -> &str {
        "Short HPI found between start and end heading regexes"
    }

    fn last_updated(&self) -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 5, 1).unwrap_or_default()
    }
}
