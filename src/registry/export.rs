//! Registry export, import and remote sync.
//!
//! JSON is the full-fidelity format (index plus every record) and the one
//! import understands completely. CSV and XML are index-level views for
//! spreadsheets and external tooling; importing them reconstructs the index
//! entries but not the record files.

use anyhow::{Context, Result, bail};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::{info, warn};

use super::{IndexEntryUpdate, MediaRegistry};
use crate::clients::MediaApiClient;
use crate::models::media::{
    UpdateUserMediaListEntryParams, UserMediaListSearchParams, UserMediaListStatus,
};
use crate::models::registry::{MediaRecord, MediaRegistryIndex, MediaRegistryIndexEntry};
use crate::utils::fs::atomic_write;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExportFormat {
    Json,
    Csv,
    Xml,
}

impl ExportFormat {
    pub fn parse(tag: &str) -> Option<Self> {
        match tag.to_ascii_lowercase().as_str() {
            "json" => Some(Self::Json),
            "csv" => Some(Self::Csv),
            "xml" => Some(Self::Xml),
            _ => None,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, PartialEq)]
pub struct RegistryExport {
    pub exported_at: DateTime<Utc>,
    pub media_api: String,
    pub index: MediaRegistryIndex,
    pub records: Vec<MediaRecord>,
}

/// XML shape: maps do not serialize cleanly, so the index is flattened to a
/// list of entries.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename = "registry")]
struct XmlExport {
    media_api: String,
    exported_at: DateTime<Utc>,
    version: String,
    #[serde(rename = "entry", default)]
    entries: Vec<MediaRegistryIndexEntry>,
}

const CSV_HEADER: &str =
    "media_id,media_api,status,progress,last_watch_position,total_duration,score,repeat,last_notified_episode,notes";

fn csv_escape(field: &str) -> String {
    if field.contains([',', '"', '\n']) {
        format!("\"{}\"", field.replace('"', "\"\""))
    } else {
        field.to_string()
    }
}

fn entry_to_csv(entry: &MediaRegistryIndexEntry) -> String {
    [
        entry.media_id.to_string(),
        entry.media_api.clone(),
        entry
            .status
            .map(|s| s.as_str().to_string())
            .unwrap_or_default(),
        entry.progress.clone(),
        entry.last_watch_position.clone().unwrap_or_default(),
        entry.total_duration.clone().unwrap_or_default(),
        entry.score.to_string(),
        entry.repeat.to_string(),
        entry.last_notified_episode.clone().unwrap_or_default(),
        entry.notes.clone(),
    ]
    .map(|f| csv_escape(&f))
    .join(",")
}

pub fn export_registry(
    registry: &MediaRegistry,
    format: ExportFormat,
    target: &Path,
) -> Result<()> {
    let index = registry.load_index()?;

    let contents = match format {
        ExportFormat::Json => {
            let export = RegistryExport {
                exported_at: Utc::now(),
                media_api: registry.media_api().to_string(),
                records: registry.get_all_media_records(),
                index,
            };
            serde_json::to_vec_pretty(&export)?
        }
        ExportFormat::Csv => {
            let mut lines = vec![CSV_HEADER.to_string()];
            let mut entries: Vec<&MediaRegistryIndexEntry> = index.media_index.values().collect();
            entries.sort_by_key(|e| e.media_id);
            lines.extend(entries.iter().map(|e| entry_to_csv(e)));
            (lines.join("\n") + "\n").into_bytes()
        }
        ExportFormat::Xml => {
            let mut entries: Vec<MediaRegistryIndexEntry> =
                index.media_index.values().cloned().collect();
            entries.sort_by_key(|e| e.media_id);
            let export = XmlExport {
                media_api: registry.media_api().to_string(),
                exported_at: Utc::now(),
                version: index.version.clone(),
                entries,
            };
            let body = quick_xml::se::to_string(&export).context("XML serialization failed")?;
            format!("<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n{body}\n").into_bytes()
        }
    };

    atomic_write(target, &contents)?;
    info!(path = %target.display(), "registry exported");
    Ok(())
}

/// Import a previously exported registry.
///
/// With `merge=false` the current registry content is replaced by the
/// export; with `merge=true` existing entries win unless the import carries a
/// newer `last_watched`.
pub fn import_registry(registry: &MediaRegistry, source: &Path, merge: bool) -> Result<usize> {
    let contents = std::fs::read_to_string(source)
        .with_context(|| format!("cannot read {}", source.display()))?;

    let (entries, records) = if contents.trim_start().starts_with('{') {
        let export: RegistryExport =
            serde_json::from_str(&contents).context("malformed JSON export")?;
        let entries: Vec<MediaRegistryIndexEntry> =
            export.index.media_index.into_values().collect();
        (entries, export.records)
    } else if contents.trim_start().starts_with('<') {
        let export: XmlExport =
            quick_xml::de::from_str(&contents).context("malformed XML export")?;
        (export.entries, Vec::new())
    } else {
        bail!("unrecognized import format (expected a JSON or XML export)");
    };

    if !merge {
        for existing in registry.load_index()?.media_index.values() {
            registry.remove_media_record(existing.media_id);
        }
    }

    let mut imported = 0;
    for record in records {
        let media_id = record.media_item.id;
        if merge && registry.get_media_record(media_id).is_some() {
            continue;
        }
        if registry.save_media_record(&record) {
            imported += 1;
        }
    }

    for entry in entries {
        if merge {
            if let Some(existing) = registry.get_media_index_entry(entry.media_id) {
                if existing.last_watched >= entry.last_watched {
                    continue;
                }
            }
        }
        registry.save_media_index_entry(entry);
    }

    info!(imported, merge, "registry import finished");
    Ok(imported)
}

/// Two-way reconciliation with the remote catalog: push local progress for
/// tracked entries, then pull the remote list into the registry so both
/// sides agree.
pub async fn sync_with_remote(
    registry: &MediaRegistry,
    api: &dyn MediaApiClient,
) -> Result<(usize, usize)> {
    if !api.is_authenticated() {
        bail!("sync requires an authenticated catalog client");
    }

    let mut pushed = 0;
    let index = registry.load_index()?;
    for entry in index.media_index.values() {
        let Some(status) = entry.status else { continue };
        let accepted = api
            .update_list_entry(&UpdateUserMediaListEntryParams {
                media_id: entry.media_id,
                status: Some(status),
                progress: Some(entry.progress.clone()),
                score: (entry.score > 0.0).then_some(entry.score),
            })
            .await;
        if accepted {
            pushed += 1;
        } else {
            warn!(media_id = entry.media_id, "remote rejected progress push");
        }
    }

    let mut pulled = 0;
    for status in [
        UserMediaListStatus::Watching,
        UserMediaListStatus::Planning,
        UserMediaListStatus::Completed,
        UserMediaListStatus::Paused,
        UserMediaListStatus::Repeating,
        UserMediaListStatus::Dropped,
    ] {
        let mut page = 1;
        loop {
            let result = api
                .search_media_list(&UserMediaListSearchParams {
                    status: Some(status),
                    page: Some(page),
                    per_page: Some(50),
                    media_type: None,
                })
                .await?;
            let Some(result) = result else { break };

            for media in &result.media {
                let remote = media.user_status.as_ref();
                registry.update_media_index_entry(
                    media.id,
                    IndexEntryUpdate {
                        media_item: Some(media.clone()),
                        status: Some(status),
                        progress: remote
                            .and_then(|u| u.progress)
                            .map(|p| p.to_string()),
                        score: remote.and_then(|u| u.score),
                        ..Default::default()
                    },
                );
                pulled += 1;
            }

            if !result.page_info.has_next_page {
                break;
            }
            page += 1;
        }
    }

    info!(pushed, pulled, "registry sync finished");
    Ok((pushed, pulled))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RegistryConfig;
    use crate::models::media::MediaItem;
    use crate::models::registry::MediaEpisode;
    use tempfile::TempDir;

    fn registry(dir: &TempDir) -> MediaRegistry {
        MediaRegistry::new(
            "anilist",
            RegistryConfig {
                media_dir: dir.path().to_path_buf(),
                lock_timeout_secs: 5,
                lock_stale_timeout_secs: 60,
            },
        )
        .unwrap()
    }

    fn seed(registry: &MediaRegistry) {
        let mut record =
            crate::models::registry::MediaRecord::new(MediaItem::with_id_and_title(1, "Foo", "Foo"));
        record.media_episodes.push(MediaEpisode::new("1"));
        registry.save_media_record(&record);
        registry.update_media_index_entry(
            1,
            IndexEntryUpdate {
                progress: Some("3".into()),
                watched: true,
                ..Default::default()
            },
        );
    }

    #[test]
    fn json_export_import_round_trips() {
        let source_dir = TempDir::new().unwrap();
        let source = registry(&source_dir);
        seed(&source);

        let file = source_dir.path().join("export.json");
        export_registry(&source, ExportFormat::Json, &file).unwrap();

        let target_dir = TempDir::new().unwrap();
        let target = registry(&target_dir);
        import_registry(&target, &file, false).unwrap();

        // Deep-equal modulo last_updated.
        let mut a = source.load_index().unwrap();
        let mut b = target.load_index().unwrap();
        a.last_updated = b.last_updated;
        assert_eq!(a, b);
        assert_eq!(
            source.get_media_record(1).unwrap(),
            target.get_media_record(1).unwrap()
        );
    }

    #[test]
    fn csv_export_writes_header_and_rows() {
        let dir = TempDir::new().unwrap();
        let reg = registry(&dir);
        seed(&reg);

        let file = dir.path().join("export.csv");
        export_registry(&reg, ExportFormat::Csv, &file).unwrap();
        let contents = std::fs::read_to_string(&file).unwrap();
        let mut lines = contents.lines();
        assert_eq!(lines.next(), Some(CSV_HEADER));
        assert!(lines.next().unwrap().starts_with("1,anilist,watching,3,"));
    }

    #[test]
    fn xml_export_round_trips_entries() {
        let dir = TempDir::new().unwrap();
        let reg = registry(&dir);
        seed(&reg);

        let file = dir.path().join("export.xml");
        export_registry(&reg, ExportFormat::Xml, &file).unwrap();

        let target_dir = TempDir::new().unwrap();
        let target = registry(&target_dir);
        import_registry(&target, &file, false).unwrap();

        let entry = target.get_media_index_entry(1).unwrap();
        assert_eq!(entry.progress, "3");
    }

    #[test]
    fn csv_fields_are_escaped() {
        assert_eq!(csv_escape("plain"), "plain");
        assert_eq!(csv_escape("a,b"), "\"a,b\"");
        assert_eq!(csv_escape("say \"hi\""), "\"say \"\"hi\"\"\"");
    }
}
