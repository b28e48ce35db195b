use chrono::{DateTime, Duration, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};

const SNAPSHOT_TIMESTAMP_FORMAT: &str = "%Y%m%d.%H%M%S";

/// 古いスナップショットリビジョンの削除方針。
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct PurgePolicy {
    /// 新しい順に残すリビジョン数。
    #[serde(default)]
    pub retain_count: Option<usize>,
    /// この日数より古いリビジョンを削除する。
    #[serde(default)]
    pub purge_after_days: Option<u32>,
}

impl PurgePolicy {
    pub fn retain(count: usize) -> Self {
        Self {
            retain_count: Some(count),
            purge_after_days: None,
        }
    }

    pub fn older_than_days(days: u32) -> Self {
        Self {
            retain_count: None,
            purge_after_days: Some(days),
        }
    }

    pub fn is_active(&self) -> bool {
        self.retain_count.is_some() || self.purge_after_days.is_some()
    }

    /// 削除対象のリビジョン文字列を返す。`current` は対象外。
    pub fn select_for_purge(
        &self,
        revisions: &[SnapshotRevision],
        current: Option<&str>,
        now: DateTime<Utc>,
    ) -> Vec<String> {
        let mut ordered: Vec<&SnapshotRevision> = revisions.iter().collect();
        ordered.sort_by(|left, right| right.cmp_age(left));

        let cutoff = self
            .purge_after_days
            .map(|days| now.naive_utc() - Duration::days(i64::from(days)));

        ordered
            .into_iter()
            .enumerate()
            .filter(|(index, revision)| {
                let over_count = self.retain_count.is_some_and(|keep| *index >= keep);
                let too_old = cutoff.is_some_and(|cutoff| revision.timestamp < cutoff);
                over_count || too_old
            })
            .map(|(_, revision)| revision.revision.clone())
            .filter(|revision| Some(revision.as_str()) != current)
            .collect()
    }
}

/// キャッシュ内の1つのスナップショットリビジョン。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotRevision {
    pub revision: String,
    pub timestamp: NaiveDateTime,
    pub build_number: u32,
}

impl SnapshotRevision {
    /// `1.0-SNAPSHOT` と `1.0-20240101.120000-3` から構築する。
    pub fn parse(base_version: &str, revision: &str) -> Option<Self> {
        let prefix = base_version.strip_suffix("SNAPSHOT")?;
        let stamp = revision.strip_prefix(prefix)?;
        let (timestamp, build_number) = parse_stamp(stamp)?;
        Some(Self {
            revision: revision.to_string(),
            timestamp,
            build_number,
        })
    }

    fn cmp_age(&self, other: &Self) -> std::cmp::Ordering {
        self.timestamp
            .cmp(&other.timestamp)
            .then_with(|| self.build_number.cmp(&other.build_number))
    }
}

/// `20240101.120000-3` の形式を読み取る。後続の文字列は無視する。
pub(crate) fn parse_stamp(stamp: &str) -> Option<(NaiveDateTime, u32)> {
    let timestamp = stamp.get(..15)?;
    let rest = stamp.get(15..)?.strip_prefix('-')?;
    let digits: String = rest.chars().take_while(char::is_ascii_digit).collect();
    let build_number = digits.parse().ok()?;
    let timestamp = NaiveDateTime::parse_from_str(timestamp, SNAPSHOT_TIMESTAMP_FORMAT).ok()?;
    Some((timestamp, build_number))
}

/// Formats an instant the way snapshot metadata stores timestamps.
pub fn snapshot_timestamp(instant: DateTime<Utc>) -> String {
    instant.format(SNAPSHOT_TIMESTAMP_FORMAT).to_string()
}
