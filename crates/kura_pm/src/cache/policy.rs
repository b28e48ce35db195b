use std::fmt;
use std::str::FromStr;
use std::sync::Mutex;

use chrono::{DateTime, Duration, FixedOffset, Local, Offset, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// 現在時刻の取得元。テストでは固定時刻に差し替える。
pub trait Clock: Send + Sync + fmt::Debug {
    fn now(&self) -> DateTime<Utc>;

    /// 暦日の境界を決めるタイムゾーン。
    fn offset(&self) -> FixedOffset;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }

    fn offset(&self) -> FixedOffset {
        Local::now().offset().fix()
    }
}

/// 手動で進める時計。
#[derive(Debug)]
pub struct FixedClock {
    now: Mutex<DateTime<Utc>>,
    offset: FixedOffset,
}

impl FixedClock {
    /// UTC で暦日を区切る時計。
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(now),
            offset: Utc.fix(),
        }
    }

    pub fn with_offset(mut self, offset: FixedOffset) -> Self {
        self.offset = offset;
        self
    }

    pub fn set(&self, now: DateTime<Utc>) {
        if let Ok(mut guard) = self.now.lock() {
            *guard = now;
        }
    }

    pub fn advance(&self, by: Duration) {
        if let Ok(mut guard) = self.now.lock() {
            *guard += by;
        }
    }
}

impl Clock for FixedClock {
    fn now(&self) -> DateTime<Utc> {
        match self.now.lock() {
            Ok(guard) => *guard,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }

    fn offset(&self) -> FixedOffset {
        self.offset
    }
}

/// 更新ポリシーの解析エラー。
#[derive(Debug, Error, PartialEq, Eq)]
#[error(
    "未対応の更新ポリシー: {invalid}. 利用可能候補: {choices}",
    choices = .available.join(", ")
)]
pub struct UpdatePolicyError {
    pub invalid: String,
    pub available: &'static [&'static str],
}

/// リモートのメタデータを再確認する頻度。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum UpdatePolicy {
    Always,
    Never,
    #[default]
    Daily,
    /// 分単位の間隔。
    Interval(u32),
}

impl UpdatePolicy {
    pub const fn variants() -> &'static [&'static str] {
        &["always", "never", "daily", "interval:<minutes>"]
    }

    /// 前回確認時刻から見て再確認が必要かどうか。未確認なら常に必要。
    pub fn is_stale(&self, last_checked: Option<DateTime<Utc>>, clock: &dyn Clock) -> bool {
        self.is_stale_at(last_checked, clock.now().with_timezone(&clock.offset()))
    }

    /// `now` のタイムゾーンで暦日を比較する。
    pub fn is_stale_at(
        &self,
        last_checked: Option<DateTime<Utc>>,
        now: DateTime<FixedOffset>,
    ) -> bool {
        let Some(last_checked) = last_checked else {
            return true;
        };
        match self {
            UpdatePolicy::Always => true,
            UpdatePolicy::Never => false,
            UpdatePolicy::Daily => {
                last_checked.with_timezone(now.offset()).date_naive() != now.date_naive()
            }
            UpdatePolicy::Interval(minutes) => {
                now.signed_duration_since(last_checked) >= Duration::minutes(i64::from(*minutes))
            }
        }
    }
}

impl fmt::Display for UpdatePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UpdatePolicy::Always => f.write_str("always"),
            UpdatePolicy::Never => f.write_str("never"),
            UpdatePolicy::Daily => f.write_str("daily"),
            UpdatePolicy::Interval(minutes) => write!(f, "interval:{minutes}"),
        }
    }
}

impl FromStr for UpdatePolicy {
    type Err = UpdatePolicyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalised = s.trim().to_ascii_lowercase();
        let invalid = || UpdatePolicyError {
            invalid: s.trim().to_string(),
            available: UpdatePolicy::variants(),
        };
        match normalised.as_str() {
            "always" => Ok(UpdatePolicy::Always),
            "never" => Ok(UpdatePolicy::Never),
            "daily" => Ok(UpdatePolicy::Daily),
            other => other
                .strip_prefix("interval:")
                .and_then(|minutes| minutes.trim().parse::<u32>().ok())
                .map(UpdatePolicy::Interval)
                .ok_or_else(invalid),
        }
    }
}

impl Serialize for UpdatePolicy {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for UpdatePolicy {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let value = String::deserialize(deserializer)?;
        UpdatePolicy::from_str(&value).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(hour: u32, minute: u32, second: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 14, hour, minute, second)
            .single()
            .expect("valid timestamp")
    }

    fn utc(instant: DateTime<Utc>) -> DateTime<FixedOffset> {
        instant.with_timezone(&Utc.fix())
    }

    #[test]
    fn missing_last_check_is_always_stale() {
        for policy in [
            UpdatePolicy::Always,
            UpdatePolicy::Never,
            UpdatePolicy::Daily,
            UpdatePolicy::Interval(10),
        ] {
            assert!(policy.is_stale_at(None, utc(at(12, 0, 0))), "{policy}");
        }
    }

    #[test]
    fn daily_compares_calendar_days() {
        let policy = UpdatePolicy::Daily;
        assert!(!policy.is_stale_at(Some(at(12, 0, 0)), utc(at(12, 0, 30))));
        assert!(policy.is_stale_at(Some(at(12, 0, 0)), utc(at(12, 0, 0) + Duration::days(1))));
    }

    #[test]
    fn daily_boundary_follows_clock_offset() {
        let tokyo = FixedOffset::east_opt(9 * 3600).expect("offset");
        let checked = at(14, 30, 0);
        let clock = FixedClock::new(at(15, 30, 0));
        assert!(!UpdatePolicy::Daily.is_stale(Some(checked), &clock));

        let clock = clock.with_offset(tokyo);
        assert!(UpdatePolicy::Daily.is_stale(Some(checked), &clock));
    }

    #[test]
    fn interval_uses_elapsed_minutes() {
        let policy = UpdatePolicy::Interval(30);
        assert!(!policy.is_stale_at(Some(at(12, 0, 0)), utc(at(12, 29, 59))));
        assert!(policy.is_stale_at(Some(at(12, 0, 0)), utc(at(12, 30, 0))));
    }

    #[test]
    fn always_and_never() {
        assert!(UpdatePolicy::Always.is_stale_at(Some(at(12, 0, 0)), utc(at(12, 0, 0))));
        assert!(!UpdatePolicy::Never.is_stale_at(Some(at(1, 0, 0)), utc(at(1, 0, 0) + Duration::days(400))));
    }

    #[test]
    fn parses_and_formats_policies() {
        assert_eq!("DAILY".parse::<UpdatePolicy>(), Ok(UpdatePolicy::Daily));
        assert_eq!("interval:15".parse::<UpdatePolicy>(), Ok(UpdatePolicy::Interval(15)));
        assert_eq!(UpdatePolicy::Interval(15).to_string(), "interval:15");
        assert!("interval:soon".parse::<UpdatePolicy>().is_err());
        assert!("hourly".parse::<UpdatePolicy>().is_err());
    }

    #[test]
    fn fixed_clock_advances() {
        let clock = FixedClock::new(at(8, 0, 0));
        clock.advance(Duration::minutes(5));
        assert_eq!(clock.now(), at(8, 5, 0));
    }
}
