// src/services/classifier.rs

//! Content-safety classification and ranking signals.
//!
//! The classification byte packs three groups:
//!
//! ```text
//!  7 6 5 | 4 3 2 | 1 0
//!  text  | image | classify
//! ```
//!
//! Each group decodes to at most one label by exact match against its table.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Ranking below this marks the document as restricted.
pub const PAGE_RANK_THRESHOLD: f32 = 0.8;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Classification {
    QueuedForClassification,
    ClassificationFailed,
    ImageHumanSafe,
    ImageAutoSafe,
    ImageAutoMaybeSafe,
    ImageAutoMaybeUnsafe,
    ImageAutoUnsafe,
    ImageHumanUnsafe,
    TextHumanSafe,
    TextAutoSafe,
    TextAutoMaybeSafe,
    TextAutoMaybeUnsafe,
    TextAutoUnsafe,
    TextContentkeeperUnsafe,
    TextHumanUnsafe,
}

impl Classification {
    /// Search-engine field name.
    pub fn field_name(self) -> &'static str {
        match self {
            Self::QueuedForClassification => "queuedForClassification",
            Self::ClassificationFailed => "classificationFailed",
            Self::ImageHumanSafe => "imageHumanSafe",
            Self::ImageAutoSafe => "imageAutoSafe",
            Self::ImageAutoMaybeSafe => "imageAutoMaybeSafe",
            Self::ImageAutoMaybeUnsafe => "imageAutoMaybeUnsafe",
            Self::ImageAutoUnsafe => "imageAutoUnsafe",
            Self::ImageHumanUnsafe => "imageHumanUnsafe",
            Self::TextHumanSafe => "textHumanSafe",
            Self::TextAutoSafe => "textAutoSafe",
            Self::TextAutoMaybeSafe => "textAutoMaybeSafe",
            Self::TextAutoMaybeUnsafe => "textAutoMaybeUnsafe",
            Self::TextAutoUnsafe => "textAutoUnsafe",
            Self::TextContentkeeperUnsafe => "textContentkeeperUnsafe",
            Self::TextHumanUnsafe => "textHumanUnsafe",
        }
    }
}

impl fmt::Display for Classification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.field_name())
    }
}

/// One bit group of the classification byte and its value table.
struct Group {
    mask: u8,
    table: &'static [(u8, Classification)],
}

const GROUPS: [Group; 3] = [
    Group {
        mask: 0b0000_0011,
        table: &[
            (0b0000_0001, Classification::QueuedForClassification),
            (0b0000_0010, Classification::ClassificationFailed),
        ],
    },
    Group {
        mask: 0b0001_1100,
        table: &[
            (0b0000_0100, Classification::ImageHumanSafe),
            (0b0000_1000, Classification::ImageAutoSafe),
            (0b0000_1100, Classification::ImageAutoMaybeSafe),
            (0b0001_0000, Classification::ImageAutoMaybeUnsafe),
            (0b0001_0100, Classification::ImageAutoUnsafe),
            (0b0001_1000, Classification::ImageHumanUnsafe),
        ],
    },
    Group {
        mask: 0b1110_0000,
        table: &[
            (0b0010_0000, Classification::TextHumanSafe),
            (0b0100_0000, Classification::TextAutoSafe),
            (0b0110_0000, Classification::TextAutoMaybeSafe),
            (0b1000_0000, Classification::TextAutoMaybeUnsafe),
            (0b1010_0000, Classification::TextAutoUnsafe),
            (0b1100_0000, Classification::TextContentkeeperUnsafe),
            (0b1110_0000, Classification::TextHumanUnsafe),
        ],
    },
];

/// Decode a classification byte into labels ordered classify, image, text.
pub fn classify(byte: u8) -> Vec<Classification> {
    GROUPS
        .iter()
        .filter_map(|group| {
            let bits = byte & group.mask;
            group
                .table
                .iter()
                .find(|(pattern, _)| *pattern == bits)
                .map(|(_, label)| *label)
        })
        .collect()
}

/// Anchor text pointing at a document, with its weight.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LinkTextScore {
    pub text: String,
    pub score: f32,
}

/// Ranking signals computed offline for a document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PageRank {
    #[serde(default)]
    pub link_text: Vec<LinkTextScore>,

    pub ranking: f32,

    #[serde(default)]
    pub classification: u8,

    #[serde(default)]
    pub site_hash_and_year: i64,
}

impl PageRank {
    /// Pair up parallel text and score slices; extra entries on either side are dropped.
    pub fn new(
        link_text: &[String],
        scores: &[f32],
        ranking: f32,
        classification: u8,
        site_hash_and_year: i64,
    ) -> Self {
        let link_text = link_text
            .iter()
            .zip(scores)
            .map(|(text, score)| LinkTextScore {
                text: text.clone(),
                score: *score,
            })
            .collect();
        Self {
            link_text,
            ranking,
            classification,
            site_hash_and_year,
        }
    }

    pub fn is_restricted(&self) -> bool {
        self.ranking < PAGE_RANK_THRESHOLD
    }

    pub fn classifications(&self) -> Vec<Classification> {
        classify(self.classification)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use Classification::*;

    #[test]
    fn test_decision_table() {
        assert_eq!(classify(0b0000_0101), vec![QueuedForClassification, ImageHumanSafe]);
        assert_eq!(classify(0b0010_0100), vec![ImageHumanSafe, TextHumanSafe]);
        assert_eq!(classify(0b1110_0100), vec![ImageHumanSafe, TextHumanUnsafe]);
        assert_eq!(classify(0b1110_1100), vec![ImageAutoMaybeSafe, TextHumanUnsafe]);
        assert_eq!(classify(0b1111_1000), vec![ImageHumanUnsafe, TextHumanUnsafe]);
    }

    #[test]
    fn test_unassessed_byte() {
        assert!(classify(0).is_empty());
        assert_eq!(classify(0b0000_0001), vec![QueuedForClassification]);
        assert_eq!(classify(0b0000_0010), vec![ClassificationFailed]);
        // 0b111 in the image group has no label
        assert_eq!(classify(0b0001_1100), Vec::<Classification>::new());
    }

    #[test]
    fn test_page_rank_signals() {
        let rank = PageRank::new(
            &["home".to_string(), "library".to_string()],
            &[0.5, 0.25],
            0.79,
            0b1100_0000,
            2015,
        );
        assert!(rank.is_restricted());
        assert_eq!(rank.link_text.len(), 2);
        assert_eq!(rank.link_text[1].text, "library");
        assert_eq!(rank.classifications(), vec![TextContentkeeperUnsafe]);
        assert_eq!(TextContentkeeperUnsafe.to_string(), "textContentkeeperUnsafe");

        let open = PageRank::new(&[], &[], 0.8, 0, 0);
        assert!(!open.is_restricted());
    }
}
