//! Mapping tables from canonical entity fields to spreadsheet column names.
//!
//! Column names are edited by hand in the source base and drift over time, so
//! every name a transformer reads lives here. Numbered groups use an `{i}`
//! placeholder that [`ColumnMap::numbered`] fills in.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::config::ConfigError;

const INDEX_PLACEHOLDER: &str = "{i}";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Destination {
    Contents,
    Materials,
    PostingGuides,
    Chats,
    Worlds,
    Groups,
    Challenges,
    Parts,
}

impl Destination {
    pub const ALL: [Destination; 8] = [
        Destination::Contents,
        Destination::Materials,
        Destination::PostingGuides,
        Destination::Chats,
        Destination::Worlds,
        Destination::Groups,
        Destination::Challenges,
        Destination::Parts,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Destination::Contents => "contents",
            Destination::Materials => "materials",
            Destination::PostingGuides => "postingGuides",
            Destination::Chats => "chats",
            Destination::Worlds => "worlds",
            Destination::Groups => "groups",
            Destination::Challenges => "challenges",
            Destination::Parts => "parts",
        }
    }

    /// REST collection path on the downstream API.
    pub fn resource(&self) -> &'static str {
        match self {
            Destination::PostingGuides => "posting-guides",
            other => other.as_str(),
        }
    }

    /// Entity field used for natural-key lookups.
    pub fn natural_key(&self) -> &'static str {
        match self {
            Destination::Materials | Destination::Worlds | Destination::Groups => "name",
            _ => "title",
        }
    }

    pub fn default_columns(&self) -> &'static [Column] {
        match self {
            Destination::Contents => CONTENTS_COLUMNS,
            Destination::Materials => MATERIAL_COLUMNS,
            Destination::PostingGuides => POSTING_GUIDE_COLUMNS,
            Destination::Chats => CHAT_COLUMNS,
            Destination::Worlds => WORLD_COLUMNS,
            Destination::Groups => GROUP_COLUMNS,
            Destination::Challenges => CHALLENGE_COLUMNS,
            Destination::Parts => PART_COLUMNS,
        }
    }
}

impl fmt::Display for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Destination {
    type Err = ConfigError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let trimmed = raw.trim();
        Destination::ALL
            .into_iter()
            .find(|destination| {
                destination.as_str().eq_ignore_ascii_case(trimmed)
                    || destination.resource().eq_ignore_ascii_case(trimmed)
            })
            .ok_or_else(|| ConfigError::UnknownDestination(trimmed.to_string()))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Column {
    pub field: &'static str,
    pub source: &'static str,
    pub required: bool,
}

const fn req(field: &'static str, source: &'static str) -> Column {
    Column {
        field,
        source,
        required: true,
    }
}

const fn opt(field: &'static str, source: &'static str) -> Column {
    Column {
        field,
        source,
        required: false,
    }
}

pub const CONTENTS_COLUMNS: &[Column] = &[
    req("title", "*액티비티 타이틀"),
    req("categoryMain", "*메인 장르"),
    opt("categorySub", "서브 장르"),
    opt("level", "난이도"),
    req("description", "*활동 설명"),
    opt("duration", "소요 시간(분)"),
    req("mainMedia", "*메인 이미지"),
    opt("sound", "배경 음악"),
    opt("introVideo", "소개 영상"),
    opt("materials", "준비물"),
    opt("guide.image", "활동 가이드 {i}_이미지"),
    opt("guide.text", "활동 가이드 {i}_설명"),
    opt("guide.tip", "활동 가이드 {i}_팁"),
    opt("checklist", "체크리스트"),
    opt("tags", "태그"),
    opt("published", "공개 여부"),
];

pub const MATERIAL_COLUMNS: &[Column] = &[
    req("name", "*준비물 이름"),
    req("image", "*준비물 이미지"),
    opt("category", "분류"),
    opt("purchaseUrl", "구매 링크"),
    opt("description", "설명"),
];

pub const POSTING_GUIDE_COLUMNS: &[Column] = &[
    req("title", "*가이드 제목"),
    req("contentTitle", "*연결 액티비티"),
    opt("step.image", "포스팅 단계 {i}_이미지"),
    opt("step.text", "포스팅 단계 {i}_설명"),
    opt("example", "예시 이미지"),
    opt("hashtags", "해시태그"),
];

pub const CHAT_COLUMNS: &[Column] = &[
    req("title", "*채팅 제목"),
    req("character", "*캐릭터"),
    opt("module.kind", "모듈 선택 {i}"),
    opt("module.text", "모듈 {i}_내용"),
    opt("module.media", "모듈 {i}_미디어"),
    opt("module.options", "모듈 {i}_선택지"),
];

pub const WORLD_COLUMNS: &[Column] = &[
    req("name", "*월드 이름"),
    req("description", "*월드 설명"),
    req("thumbnail", "*대표 이미지"),
    opt("background", "배경 영상"),
    opt("level", "난이도"),
    opt("contents", "포함 액티비티"),
    opt("order", "정렬 순서"),
];

pub const GROUP_COLUMNS: &[Column] = &[
    req("name", "*그룹 이름"),
    req("world", "*소속 월드"),
    req("contents", "*액티비티 목록"),
    opt("icon", "아이콘"),
    opt("order", "정렬 순서"),
];

pub const CHALLENGE_COLUMNS: &[Column] = &[
    req("title", "*챌린지 제목"),
    opt("description", "챌린지 설명"),
    req("periodDays", "*기간(일)"),
    opt("level", "난이도"),
    req("mainMedia", "*메인 이미지"),
    opt("mission.title", "미션 {i}_제목"),
    opt("mission.image", "미션 {i}_이미지"),
    opt("reward", "보상"),
];

pub const PART_COLUMNS: &[Column] = &[
    req("title", "*파트 제목"),
    req("challenge", "*챌린지"),
    req("day", "*일차"),
    opt("guide.image", "활동 가이드 {i}_이미지"),
    opt("guide.text", "활동 가이드 {i}_설명"),
    opt("guide.tip", "활동 가이드 {i}_팁"),
    opt("checklist", "체크리스트"),
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MappedColumn {
    pub field: &'static str,
    pub source: String,
    pub required: bool,
}

/// Resolved column table for one destination.
#[derive(Debug, Clone)]
pub struct ColumnMap {
    destination: Destination,
    columns: Vec<MappedColumn>,
}

impl ColumnMap {
    pub fn defaults(destination: Destination) -> Self {
        let columns = destination
            .default_columns()
            .iter()
            .map(|column| MappedColumn {
                field: column.field,
                source: column.source.to_string(),
                required: column.required,
            })
            .collect();
        Self {
            destination,
            columns,
        }
    }

    /// Defaults with selected source columns renamed; unknown fields are an error.
    pub fn with_overrides(
        destination: Destination,
        overrides: &HashMap<String, String>,
    ) -> Result<Self, ConfigError> {
        let mut map = Self::defaults(destination);
        for (field, source) in overrides {
            let column = map
                .columns
                .iter_mut()
                .find(|column| column.field == field)
                .ok_or_else(|| ConfigError::UnknownColumn {
                    destination: destination.to_string(),
                    field: field.clone(),
                })?;
            column.source = source.clone();
        }
        Ok(map)
    }

    pub fn destination(&self) -> Destination {
        self.destination
    }

    pub fn column(&self, field: &str) -> Option<&MappedColumn> {
        self.columns.iter().find(|column| column.field == field)
    }

    pub fn source(&self, field: &str) -> Option<&str> {
        self.column(field).map(|column| column.source.as_str())
    }

    /// Source column for the `index`-th member of a numbered group.
    pub fn numbered(&self, field: &str, index: usize) -> Option<String> {
        self.source(field)
            .map(|template| template.replace(INDEX_PLACEHOLDER, &index.to_string()))
    }

    pub fn columns(&self) -> &[MappedColumn] {
        &self.columns
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn destinations_parse_from_name_or_resource() {
        assert_eq!(
            "postingGuides".parse::<Destination>().unwrap(),
            Destination::PostingGuides
        );
        assert_eq!(
            "posting-guides".parse::<Destination>().unwrap(),
            Destination::PostingGuides
        );
        assert_eq!("WORLDS".parse::<Destination>().unwrap(), Destination::Worlds);
        assert!("planets".parse::<Destination>().is_err());
    }

    #[test]
    fn numbered_columns_fill_the_index() {
        let map = ColumnMap::defaults(Destination::Contents);
        assert_eq!(
            map.numbered("guide.image", 3).as_deref(),
            Some("활동 가이드 3_이미지")
        );
        assert_eq!(map.numbered("missing", 1), None);
    }

    #[test]
    fn every_destination_declares_its_natural_key_column() {
        for destination in Destination::ALL {
            let map = ColumnMap::defaults(destination);
            let key = map
                .column(destination.natural_key())
                .unwrap_or_else(|| panic!("{destination} lacks {}", destination.natural_key()));
            assert!(key.required, "{destination} natural key must be required");
        }
    }

    #[test]
    fn field_names_are_unique_per_destination() {
        for destination in Destination::ALL {
            let columns = destination.default_columns();
            for (index, column) in columns.iter().enumerate() {
                assert!(
                    columns[index + 1..].iter().all(|other| other.field != column.field),
                    "{destination} repeats {}",
                    column.field
                );
            }
        }
    }
}
