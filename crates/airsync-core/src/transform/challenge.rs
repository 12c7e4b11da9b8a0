use serde::Serialize;

use super::level::normalize_optional_level;
use super::media::MediaBlock;
use super::{FieldReader, TransformError, fold_media};

pub const MAX_MISSIONS: usize = 7;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Mission {
    pub title: String,
    pub media_url: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChallengeEntity {
    pub title: String,
    pub description: Option<String>,
    pub period_days: u32,
    pub level: u8,
    pub main_media: MediaBlock,
    pub missions: Vec<Mission>,
    pub reward: Option<String>,
}

pub fn transform(reader: &FieldReader<'_>) -> Result<ChallengeEntity, TransformError> {
    let title = reader.required_text("title")?;
    let period_days = reader.required_count("periodDays")?;
    let main_media = reader.required_media("mainMedia")?;

    let missions = (1..=MAX_MISSIONS)
        .filter_map(|index| {
            let title = reader.text_at("mission.title", index)?;
            Some(Mission {
                title,
                media_url: fold_media(&reader.attachments_at("mission.image", index))
                    .map(|media| media.default_url),
            })
        })
        .collect();

    Ok(ChallengeEntity {
        title,
        description: reader.text("description"),
        period_days,
        level: normalize_optional_level(reader.raw("level")),
        main_media,
        missions,
        reward: reader.text("reward"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::columns::{ColumnMap, Destination};
    use crate::record::RawRecord;
    use serde_json::json;

    #[test]
    fn missions_are_anchored_on_their_titles() {
        let record: RawRecord = serde_json::from_value(json!({
            "id": "c1",
            "*챌린지 제목": "7일 그림일기",
            "*기간(일)": 7,
            "난이도": 5,
            "*메인 이미지": [{ "url": "https://cdn.example.com/diary.png" }],
            "미션 1_제목": "하늘 그리기",
            "미션 1_이미지": [{ "url": "https://cdn.example.com/sky.png" }],
            "미션 2_이미지": [{ "url": "https://cdn.example.com/orphan.png" }],
            "미션 3_제목": "친구 그리기",
        }))
        .unwrap();
        let columns = ColumnMap::defaults(Destination::Challenges);
        let entity = transform(&FieldReader::new(&record, &columns)).unwrap();

        assert_eq!(entity.period_days, 7);
        assert_eq!(entity.level, 3);
        assert_eq!(entity.missions.len(), 2);
        assert_eq!(
            entity.missions[0].media_url.as_deref(),
            Some("https://cdn.example.com/sky.png")
        );
        assert_eq!(entity.missions[1].title, "친구 그리기");
        assert_eq!(entity.missions[1].media_url, None);
    }
}
