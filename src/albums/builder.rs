use crate::database::MediaRecord;
use crate::folder_key::FolderKey;
use std::collections::BTreeMap;

/// An album the library's folder layout calls for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Candidate {
    /// Default title, the last segment of the folder key.
    pub title: String,
    /// Media ids ordered by path.
    pub members: Vec<i64>,
}

pub type CandidateMap = BTreeMap<FolderKey, Candidate>;

/// Group media by stored folder key. Media without a key join no album.
pub fn build_candidates(media: &[MediaRecord]) -> CandidateMap {
    let mut sorted: Vec<&MediaRecord> = media.iter().collect();
    sorted.sort_by(|a, b| a.path.cmp(&b.path));

    let mut candidates = CandidateMap::new();
    for record in sorted {
        let Some(key) = record.folder_key.as_deref() else {
            continue;
        };
        let key = FolderKey::from_stored(key);
        candidates
            .entry(key)
            .or_insert_with_key(|key| Candidate {
                title: key.inferred_title().to_string(),
                members: Vec::new(),
            })
            .members
            .push(record.id);
    }
    candidates
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::ThumbStatus;
    use crate::formats::MediaKind;

    fn record(id: i64, path: &str, key: Option<&str>) -> MediaRecord {
        MediaRecord {
            id,
            path: path.to_string(),
            kind: MediaKind::Image,
            mtime: 0,
            size: 0,
            thumb_path: None,
            thumb_status: ThumbStatus::Pending,
            favorite: false,
            folder_key: key.map(str::to_string),
            rotation: None,
            indexed_at: 0,
        }
    }

    #[test]
    fn test_groups_by_key_in_path_order() {
        let media = vec![
            record(1, "/lib/2023/trip/b.jpg", Some("2023/trip")),
            record(2, "/lib/2023/trip/a.jpg", Some("2023/trip")),
            record(3, "/lib/2023/home/c.jpg", Some("2023/home")),
            record(4, "/elsewhere.jpg", None),
        ];

        let candidates = build_candidates(&media);

        assert_eq!(candidates.len(), 2);
        let trip = &candidates[&FolderKey::from_stored("2023/trip")];
        assert_eq!(trip.title, "trip");
        assert_eq!(trip.members, vec![2, 1]);
        assert_eq!(candidates[&FolderKey::from_stored("2023/home")].members, vec![3]);
    }

    #[test]
    fn test_no_media_no_candidates() {
        assert!(build_candidates(&[]).is_empty());
    }
}
