//! `maven-metadata.xml` の読み書きとマージ。

pub mod service;

use std::io::Cursor;

use chrono::{DateTime, NaiveDateTime, Utc};
use quick_xml::Writer;
use quick_xml::de::from_reader;
use quick_xml::events::{BytesDecl, BytesEnd, BytesStart, BytesText, Event};
use serde::Deserialize;
use thiserror::Error;

use crate::cache::{MetadataLevel, snapshot_timestamp};
use crate::model::{ArtifactVersion, Dependency, sort_versions};

pub use service::{MetadataError, MetadataService};

const LAST_UPDATED_FORMAT: &str = "%Y%m%d%H%M%S";

/// Mavenリポジトリが提供する `maven-metadata.xml` の表現。
#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
pub struct MavenMetadata {
    #[serde(rename = "groupId", default)]
    pub group_id: String,
    #[serde(rename = "artifactId", default)]
    pub artifact_id: String,
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub versioning: Option<Versioning>,
}

#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
pub struct Versioning {
    #[serde(default)]
    pub latest: Option<String>,
    #[serde(default)]
    pub release: Option<String>,
    /// スナップショットのビルド履歴。リモートは通常1件のみ返す。
    #[serde(default, rename = "snapshot")]
    pub snapshots: Vec<Snapshot>,
    #[serde(default)]
    pub versions: Versions,
    #[serde(rename = "lastUpdated", default)]
    pub last_updated: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
pub struct Versions {
    #[serde(default)]
    #[serde(rename = "version")]
    pub items: Vec<String>,
}

#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
pub struct Snapshot {
    #[serde(default)]
    pub timestamp: Option<String>,
    #[serde(rename = "buildNumber", default)]
    pub build_number: Option<u32>,
    #[serde(rename = "localCopy", default)]
    pub local_copy: Option<bool>,
}

impl Snapshot {
    fn stamp(&self) -> Option<(&str, u32)> {
        Some((self.timestamp.as_deref()?, self.build_number?))
    }
}

/// `maven-metadata.xml` のパースエラー。
#[derive(Debug, Error)]
pub enum MetadataParseError {
    #[error("maven-metadata.xmlの解析に失敗しました: {0}")]
    Xml(#[from] quick_xml::DeError),
}

/// `maven-metadata.xml` の書き出しエラー。
#[derive(Debug, Error)]
pub enum MetadataWriteError {
    #[error("maven-metadata.xml の書き込み中にIOエラーが発生しました: {0}")]
    Io(#[from] std::io::Error),
    #[error("maven-metadata.xml のXML生成に失敗しました: {0}")]
    Writer(#[from] quick_xml::Error),
    #[error("maven-metadata.xml をUTF-8文字列へ変換できません: {0}")]
    Utf8(#[from] std::string::FromUtf8Error),
}

/// `maven-metadata.xml` を構造体へ変換する。
pub fn parse_metadata(bytes: &[u8]) -> Result<MavenMetadata, MetadataParseError> {
    from_reader(bytes).map_err(MetadataParseError::from)
}

impl MavenMetadata {
    /// 座標に対応する空のメタデータ。
    pub fn for_dependency(dependency: &Dependency, level: MetadataLevel) -> Self {
        Self {
            group_id: dependency.group_id.clone(),
            artifact_id: dependency.artifact_id.clone(),
            version: matches!(level, MetadataLevel::Version).then(|| dependency.version.clone()),
            versioning: None,
        }
    }

    /// 利用可能なバージョン一覧を返す（空の場合は空スライス）。
    pub fn versions(&self) -> &[String] {
        self.versioning
            .as_ref()
            .map(|versioning| versioning.versions.items.as_slice())
            .unwrap_or_default()
    }

    pub fn release(&self) -> Option<&str> {
        self.versioning
            .as_ref()
            .and_then(|versioning| versioning.release.as_deref())
    }

    pub fn latest(&self) -> Option<&str> {
        self.versioning
            .as_ref()
            .and_then(|versioning| versioning.latest.as_deref())
    }

    pub fn last_updated(&self) -> Option<&str> {
        self.versioning
            .as_ref()
            .and_then(|versioning| versioning.last_updated.as_deref())
    }

    pub fn last_updated_at(&self) -> Option<DateTime<Utc>> {
        NaiveDateTime::parse_from_str(self.last_updated()?, LAST_UPDATED_FORMAT)
            .ok()
            .map(|naive| naive.and_utc())
    }

    pub fn snapshots(&self) -> &[Snapshot] {
        self.versioning
            .as_ref()
            .map(|versioning| versioning.snapshots.as_slice())
            .unwrap_or_default()
    }

    /// タイムスタンプとビルド番号が最大のスナップショット。
    pub fn latest_snapshot(&self) -> Option<&Snapshot> {
        self.snapshots()
            .iter()
            .filter(|snapshot| snapshot.stamp().is_some())
            .max_by(|left, right| left.stamp().cmp(&right.stamp()))
    }

    /// `1.0-SNAPSHOT` を `1.0-20240101.120000-3` のようなリビジョンへ変換する。
    pub fn snapshot_revision(&self, base_version: &str) -> Option<String> {
        let (timestamp, build_number) = self.latest_snapshot()?.stamp()?;
        let prefix = base_version.strip_suffix("SNAPSHOT")?;
        Some(format!("{prefix}{timestamp}-{build_number}"))
    }

    pub fn highest_build_number(&self) -> u32 {
        self.snapshots()
            .iter()
            .filter_map(|snapshot| snapshot.build_number)
            .max()
            .unwrap_or(0)
    }

    /// ローカルで公開したスナップショットを履歴に追加する。
    pub fn record_snapshot(&mut self, now: DateTime<Utc>) -> Snapshot {
        let snapshot = Snapshot {
            timestamp: Some(snapshot_timestamp(now)),
            build_number: Some(self.highest_build_number() + 1),
            local_copy: None,
        };
        let versioning = self.versioning.get_or_insert_with(Versioning::default);
        versioning.snapshots.push(snapshot.clone());
        versioning.last_updated = Some(now.format(LAST_UPDATED_FORMAT).to_string());
        self.refresh_pointers(None, None);
        snapshot
    }

    /// バージョン一覧へ追加する。
    pub fn add_version(&mut self, version: &str, now: DateTime<Utc>) {
        let versioning = self.versioning.get_or_insert_with(Versioning::default);
        versioning.versions.items.push(version.to_string());
        sort_versions(&mut versioning.versions.items);
        versioning.last_updated = Some(now.format(LAST_UPDATED_FORMAT).to_string());
        self.refresh_pointers(None, None);
    }

    /// 他リポジトリのメタデータを取り込む。
    ///
    /// バージョンは和集合を昇順に並べ、RELEASE は修飾子のない最大バージョン、
    /// LATEST は最大バージョンとなる。lastUpdated は新しい方を採るが、
    /// スナップショットがある場合は最新スナップショットの時刻に固定される。
    pub fn merge(&mut self, incoming: &MavenMetadata) {
        if self.group_id.is_empty() {
            self.group_id = incoming.group_id.clone();
        }
        if self.artifact_id.is_empty() {
            self.artifact_id = incoming.artifact_id.clone();
        }
        if self.version.is_none() {
            self.version = incoming.version.clone();
        }

        let Some(theirs) = incoming.versioning.as_ref() else {
            return;
        };
        let ours = self.versioning.get_or_insert_with(Versioning::default);

        ours.versions
            .items
            .extend(theirs.versions.items.iter().cloned());
        sort_versions(&mut ours.versions.items);

        for snapshot in &theirs.snapshots {
            if !ours.snapshots.contains(snapshot) {
                ours.snapshots.push(snapshot.clone());
            }
        }
        ours.snapshots
            .sort_by(|left, right| left.stamp().cmp(&right.stamp()));

        ours.last_updated = ours
            .last_updated
            .take()
            .into_iter()
            .chain(theirs.last_updated.clone())
            .max();

        let release = theirs.release.clone();
        let latest = theirs.latest.clone();
        self.refresh_pointers(release, latest);
    }

    fn refresh_pointers(&mut self, release_hint: Option<String>, latest_hint: Option<String>) {
        let pinned = self
            .latest_snapshot()
            .and_then(|snapshot| snapshot.timestamp.as_deref())
            .map(|timestamp| timestamp.replace('.', ""));
        let Some(versioning) = self.versioning.as_mut() else {
            return;
        };

        let items = &versioning.versions.items;
        let release = items
            .iter()
            .rev()
            .find(|version| ArtifactVersion::parse(version).is_release())
            .cloned();
        versioning.release = release.or_else(|| higher(versioning.release.take(), release_hint));

        let latest = items.last().cloned();
        versioning.latest = latest.or_else(|| higher(versioning.latest.take(), latest_hint));

        if let Some(pinned) = pinned {
            versioning.last_updated = Some(pinned);
        }
    }

    /// `maven-metadata.xml` 形式で書き出す。
    pub fn to_xml(&self) -> Result<String, MetadataWriteError> {
        let mut writer = Writer::new_with_indent(Cursor::new(Vec::new()), b' ', 2);
        writer.write_event(Event::Decl(BytesDecl::new("1.0", Some("UTF-8"), None)))?;
        writer.write_event(Event::Start(BytesStart::new("metadata")))?;
        write_element(&mut writer, "groupId", &self.group_id)?;
        write_element(&mut writer, "artifactId", &self.artifact_id)?;
        if let Some(version) = &self.version {
            write_element(&mut writer, "version", version)?;
        }

        if let Some(versioning) = &self.versioning {
            writer.write_event(Event::Start(BytesStart::new("versioning")))?;
            if let Some(latest) = &versioning.latest {
                write_element(&mut writer, "latest", latest)?;
            }
            if let Some(release) = &versioning.release {
                write_element(&mut writer, "release", release)?;
            }
            for snapshot in &versioning.snapshots {
                writer.write_event(Event::Start(BytesStart::new("snapshot")))?;
                if let Some(timestamp) = &snapshot.timestamp {
                    write_element(&mut writer, "timestamp", timestamp)?;
                }
                if let Some(build_number) = snapshot.build_number {
                    write_element(&mut writer, "buildNumber", &build_number.to_string())?;
                }
                if let Some(local_copy) = snapshot.local_copy {
                    write_element(&mut writer, "localCopy", &local_copy.to_string())?;
                }
                writer.write_event(Event::End(BytesEnd::new("snapshot")))?;
            }
            if !versioning.versions.items.is_empty() {
                writer.write_event(Event::Start(BytesStart::new("versions")))?;
                for version in &versioning.versions.items {
                    write_element(&mut writer, "version", version)?;
                }
                writer.write_event(Event::End(BytesEnd::new("versions")))?;
            }
            if let Some(last_updated) = &versioning.last_updated {
                write_element(&mut writer, "lastUpdated", last_updated)?;
            }
            writer.write_event(Event::End(BytesEnd::new("versioning")))?;
        }

        writer.write_event(Event::End(BytesEnd::new("metadata")))?;

        let bytes = writer.into_inner().into_inner();
        let mut xml = String::from_utf8(bytes)?;
        if !xml.ends_with('\n') {
            xml.push('\n');
        }
        Ok(xml)
    }
}

fn higher(left: Option<String>, right: Option<String>) -> Option<String> {
    left.into_iter()
        .chain(right)
        .max_by(|a, b| ArtifactVersion::parse(a).cmp(&ArtifactVersion::parse(b)))
}

fn write_element(
    writer: &mut Writer<Cursor<Vec<u8>>>,
    name: &str,
    text: &str,
) -> Result<(), MetadataWriteError> {
    writer.write_event(Event::Start(BytesStart::new(name)))?;
    writer.write_event(Event::Text(BytesText::new(text)))?;
    writer.write_event(Event::End(BytesEnd::new(name)))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    const SAMPLE: &str = r#"
        <metadata>
          <groupId>org.example</groupId>
          <artifactId>demo</artifactId>
          <versioning>
            <latest>1.2.3</latest>
            <release>1.2.2</release>
            <versions>
              <version>1.0.0</version>
              <version>1.1.0</version>
              <version>1.2.2</version>
              <version>1.2.3</version>
            </versions>
            <lastUpdated>20250101010101</lastUpdated>
          </versioning>
        </metadata>
    "#;

    const SNAPSHOT_SAMPLE: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
        <metadata modelVersion="1.1.0">
          <groupId>org.example</groupId>
          <artifactId>demo</artifactId>
          <version>1.0-SNAPSHOT</version>
          <versioning>
            <snapshot>
              <timestamp>20240101.120000</timestamp>
              <buildNumber>3</buildNumber>
            </snapshot>
            <lastUpdated>20240101120000</lastUpdated>
            <snapshotVersions>
              <snapshotVersion>
                <extension>jar</extension>
                <value>1.0-20240101.120000-3</value>
                <updated>20240101120000</updated>
              </snapshotVersion>
            </snapshotVersions>
          </versioning>
        </metadata>
    "#;

    fn listing(versions: &[&str], last_updated: &str) -> MavenMetadata {
        MavenMetadata {
            group_id: "org.example".into(),
            artifact_id: "demo".into(),
            version: None,
            versioning: Some(Versioning {
                versions: Versions {
                    items: versions.iter().map(|v| v.to_string()).collect(),
                },
                last_updated: Some(last_updated.to_string()),
                ..Versioning::default()
            }),
        }
    }

    #[test]
    fn parse_sample_metadata() {
        let metadata = parse_metadata(SAMPLE.as_bytes()).expect("metadata parse");
        assert_eq!(metadata.group_id, "org.example");
        assert_eq!(metadata.artifact_id, "demo");
        assert_eq!(metadata.versions().len(), 4);
        assert_eq!(metadata.latest(), Some("1.2.3"));
        assert_eq!(metadata.release(), Some("1.2.2"));
        assert_eq!(
            metadata.last_updated_at().map(|at| at.to_rfc3339()),
            Some("2025-01-01T01:01:01+00:00".to_string())
        );
    }

    #[test]
    fn snapshot_metadata_yields_revision() {
        let metadata = parse_metadata(SNAPSHOT_SAMPLE.as_bytes()).expect("metadata parse");
        assert_eq!(metadata.version.as_deref(), Some("1.0-SNAPSHOT"));
        assert_eq!(
            metadata.snapshot_revision("1.0-SNAPSHOT").as_deref(),
            Some("1.0-20240101.120000-3")
        );
        assert_eq!(metadata.highest_build_number(), 3);
    }

    #[test]
    fn merge_unions_versions_and_recomputes_pointers() {
        let mut local = listing(&["1.0", "1.1"], "20240101000000");
        let remote = listing(&["1.1", "1.2", "1.3-beta"], "20240301000000");

        local.merge(&remote);
        assert_eq!(local.versions(), &["1.0", "1.1", "1.2", "1.3-beta"]);
        assert_eq!(local.release(), Some("1.2"));
        assert_eq!(local.latest(), Some("1.3-beta"));
        assert_eq!(local.last_updated(), Some("20240301000000"));
    }

    #[test]
    fn merge_keeps_newer_local_timestamp() {
        let mut local = listing(&["1.0"], "20240501000000");
        local.merge(&listing(&["1.0"], "20240301000000"));
        assert_eq!(local.last_updated(), Some("20240501000000"));
    }

    #[test]
    fn snapshot_history_pins_last_updated() {
        let mut local = parse_metadata(SNAPSHOT_SAMPLE.as_bytes()).expect("metadata parse");
        let mut remote = local.clone();
        if let Some(versioning) = remote.versioning.as_mut() {
            versioning.snapshots = vec![Snapshot {
                timestamp: Some("20240105.083000".into()),
                build_number: Some(4),
                local_copy: None,
            }];
            versioning.last_updated = Some("20240109000000".into());
        }

        local.merge(&remote);
        assert_eq!(local.snapshots().len(), 2);
        assert_eq!(local.last_updated(), Some("20240105083000"));
        assert_eq!(
            local.snapshot_revision("1.0-SNAPSHOT").as_deref(),
            Some("1.0-20240105.083000-4")
        );
    }

    #[test]
    fn record_snapshot_assigns_next_build_number() {
        let mut metadata = parse_metadata(SNAPSHOT_SAMPLE.as_bytes()).expect("metadata parse");
        let now = Utc
            .with_ymd_and_hms(2024, 2, 1, 9, 30, 0)
            .single()
            .expect("valid timestamp");
        let recorded = metadata.record_snapshot(now);
        assert_eq!(recorded.build_number, Some(4));
        assert_eq!(recorded.timestamp.as_deref(), Some("20240201.093000"));
        assert_eq!(metadata.last_updated(), Some("20240201093000"));
    }

    #[test]
    fn written_xml_reads_back() {
        let mut metadata = parse_metadata(SNAPSHOT_SAMPLE.as_bytes()).expect("metadata parse");
        metadata.record_snapshot(Utc::now());
        let xml = metadata.to_xml().expect("write xml");
        assert!(xml.starts_with("<?xml"));
        let reparsed = parse_metadata(xml.as_bytes()).expect("reparse");
        assert_eq!(reparsed, metadata);
    }
}
