//! Maintenance operations: compaction and index verify/repair.

use uuid::Uuid;

use trellis_core::error::{Result, TrellisError};
use trellis_core::repo::Repository;
use trellis_core::schema::TypeKind;

use crate::fs_store::Precondition;
use crate::manifest::{IndexDoc, IndexEntry};
use crate::segment;
use crate::store::{CompactionEntry, CompactionReport, IndexReport, LeaseKeepAlive, ObjectRepository};

fn kind_dir(kind: TypeKind) -> &'static str {
    match kind {
        TypeKind::Entity => "entities",
        TypeKind::Relation => "relations",
    }
}

impl ObjectRepository {
    /// Merge per-commit data files into range snapshots. With
    /// `apply = false` only the plan is returned.
    ///
    /// The snapshot preserves `commit_id` per row and deterministic
    /// `commit_id ASC, identity ASC` ordering, so temporal queries are
    /// unchanged. Original per-commit files are retained; only the index
    /// entries are replaced.
    pub fn compact(&self, type_name: Option<&str>, apply: bool) -> Result<CompactionReport> {
        let owner = format!("compaction-{}-{}", self.runtime_id(), Uuid::new_v4());
        let config = self.config().clone();

        let _keepalive = if apply {
            if !self.acquire_lock(&owner, config.store_lock_timeout_ms, config.store_lease_ttl_ms)? {
                return Err(TrellisError::LockContention {
                    timeout_ms: config.store_lock_timeout_ms,
                });
            }
            Some(LeaseKeepAlive::start(
                self.lock_renewer(&owner, config.store_lease_ttl_ms)?,
                std::time::Duration::from_millis((config.store_lease_ttl_ms / 3).max(100)),
            ))
        } else {
            None
        };

        let result = self.compact_inner(type_name, apply);

        if apply {
            let _ = self.release_lock(&owner);
        }
        result
    }

    fn compact_inner(&self, type_name: Option<&str>, apply: bool) -> Result<CompactionReport> {
        let (head_before, head_etag_before) = self.head_doc()?;
        let mut planned = Vec::new();

        for (kind, name) in self.types_for_compaction(type_name)? {
            let index = self.read_index_for(kind, &name)?;
            let (mergeable, kept): (Vec<IndexEntry>, Vec<IndexEntry>) = index
                .entries
                .iter()
                .cloned()
                .partition(|e| e.path.starts_with("commits/"));
            if mergeable.len() < 2 {
                continue;
            }

            let min = mergeable.iter().map(|e| e.min_commit_id).min().unwrap();
            let max = mergeable.iter().map(|e| e.max_commit_id).max().unwrap();
            let snapshot_path = format!(
                "snapshots/{}/{name}-{min}-{max}.segment.jsonl",
                kind_dir(kind)
            );

            let entry = CompactionEntry {
                kind: kind.to_string(),
                type_name: name.clone(),
                merged_files: mergeable.len(),
                min_commit_id: min,
                max_commit_id: max,
                snapshot_path: snapshot_path.clone(),
            };

            if !apply {
                planned.push(entry);
                continue;
            }

            let bytes = match kind {
                TypeKind::Entity => {
                    let mut rows = Vec::new();
                    for source in &mergeable {
                        let Some((data, _)) = self.object_get(&source.path)? else {
                            return Err(TrellisError::storage(
                                "compact",
                                format!("data file '{}' missing", source.path),
                            ));
                        };
                        rows.extend(segment::decode_entity_rows(&data)?);
                    }
                    rows.sort_by(|a, b| (a.commit_id, &a.key).cmp(&(b.commit_id, &b.key)));
                    segment::encode_entity_rows(&name, &rows)?.0
                }
                TypeKind::Relation => {
                    let mut rows = Vec::new();
                    for source in &mergeable {
                        let Some((data, _)) = self.object_get(&source.path)? else {
                            return Err(TrellisError::storage(
                                "compact",
                                format!("data file '{}' missing", source.path),
                            ));
                        };
                        rows.extend(segment::decode_relation_rows(&data)?);
                    }
                    rows.sort_by(|a, b| {
                        (a.commit_id, &a.left_key, &a.right_key, &a.instance_key).cmp(&(
                            b.commit_id,
                            &b.left_key,
                            &b.right_key,
                            &b.instance_key,
                        ))
                    });
                    segment::encode_relation_rows(&name, &rows)?.0
                }
            };

            self.object_put(&snapshot_path, &bytes, Precondition::None)?;

            // Head stability check immediately before index publish: a
            // concurrent writer means our merged set may be stale.
            let (_, head_etag_now) = self.head_doc()?;
            if head_etag_now != head_etag_before {
                return Err(TrellisError::storage(
                    "compact",
                    format!(
                        "head advanced past commit {} during compaction; replan required",
                        head_before.commit_id
                    ),
                ));
            }

            let mut entries = kept;
            entries.push(IndexEntry {
                min_commit_id: min,
                max_commit_id: max,
                path: snapshot_path,
                schema_version_id: None,
            });
            entries.sort_by_key(|e| (e.min_commit_id, e.max_commit_id));
            let new_index = IndexDoc {
                max_indexed_commit: index.max_indexed_commit,
                entries,
            };
            self.write_index_for(kind, &name, &new_index)?;
            tracing::info!(
                type_name = name.as_str(),
                merged = entry.merged_files,
                "compacted per-commit files into snapshot"
            );
            planned.push(entry);
        }

        Ok(CompactionReport { planned, applied: apply })
    }

    /// Compare advisory indices against the authoritative manifest chain.
    pub fn index_verify(&self) -> Result<IndexReport> {
        let (head, _) = self.head_doc()?;
        let mut lagging = Vec::new();
        let mut checked = 0;

        for (kind, name) in self.types_for_compaction(None)? {
            checked += 1;
            let stored = self.read_index_for(kind, &name)?;
            let expected = self.rebuild_index_from_chain(kind, &name, &head)?;

            let behind = stored.max_indexed_commit < head.commit_id;
            let uncovered = expected
                .entries
                .iter()
                .any(|e| !stored.entries.iter().any(|s| s.covers(e.min_commit_id)));
            if behind || uncovered {
                lagging.push(format!("{kind}:{name}"));
            }
        }

        Ok(IndexReport {
            types_checked: checked,
            types_lagging: lagging,
            repaired: false,
        })
    }

    /// Rebuild lagging indices from the manifest chain. With
    /// `apply = false` only reports what would change.
    pub fn index_repair(&self, apply: bool) -> Result<IndexReport> {
        let mut report = self.index_verify()?;
        if !apply || report.types_lagging.is_empty() {
            return Ok(report);
        }

        let (head, _) = self.head_doc()?;
        for entry in &report.types_lagging {
            let Some((kind_str, name)) = entry.split_once(':') else {
                continue;
            };
            let kind = TypeKind::parse(kind_str)?;
            let rebuilt = self.rebuild_index_from_chain(kind, name, &head)?;
            self.write_index_for(kind, name, &rebuilt)?;
            tracing::info!(type_name = name, "index rebuilt from manifest chain");
        }
        report.repaired = true;
        Ok(report)
    }
}
