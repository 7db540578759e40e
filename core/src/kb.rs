//! Applying accepted kb-update proposals to disk and rescanning the KB
//! directory into the file index.

use chrono::DateTime;
use chrono::Utc;
use domainos_protocol::Domain;
use domainos_protocol::KbFile;
use domainos_protocol::KbTier;
use domainos_protocol::TierSource;

use crate::blocks::kb_update::KbAction;
use crate::blocks::kb_update::KbUpdateProposal;
use crate::blocks::kb_update::WriteMode;
use crate::canonical::sha256_hex;
use crate::error::DomainOsErr;
use crate::error::Result;
use crate::store::Store;
use crate::util::new_id;

/// Apply one accepted proposal to the domain's KB root. The parser already
/// rejected traversal and mode violations; this only performs the write.
pub async fn apply_kb_update(domain: &Domain, proposal: &KbUpdateProposal) -> Result<()> {
    let path = domain.kb_path.join(&proposal.file);
    match proposal.action {
        KbAction::Delete => {
            tokio::fs::remove_file(&path).await?;
        }
        KbAction::Create | KbAction::Update => {
            if let Some(parent) = path.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            match proposal.mode {
                Some(WriteMode::Append) => {
                    let mut existing = tokio::fs::read_to_string(&path).await.unwrap_or_default();
                    if !existing.is_empty() && !existing.ends_with('\n') {
                        existing.push('\n');
                    }
                    existing.push_str(&proposal.content);
                    tokio::fs::write(&path, existing).await?;
                }
                // patch mode arrives pre-resolved: the content is the full
                // post-patch text by the time it reaches the applier
                _ => {
                    tokio::fs::write(&path, &proposal.content).await?;
                }
            }
        }
    }
    Ok(())
}

fn infer_tier(relative_path: &str) -> KbTier {
    let is_root = !relative_path.contains('/');
    let file_name = relative_path
        .rsplit('/')
        .next()
        .unwrap_or(relative_path)
        .to_lowercase();
    match file_name.as_str() {
        "claude.md" if is_root => KbTier::Structural,
        "kb_digest.md" => KbTier::Status,
        "kb_intel.md" => KbTier::Intelligence,
        _ => KbTier::General,
    }
}

/// Rescan the domain's KB root: upsert every markdown file with its content
/// hash, drop index rows whose files vanished. Returns the synced paths.
pub async fn scan_domain_kb(
    store: &Store,
    domain: &Domain,
    now: DateTime<Utc>,
) -> Result<Vec<String>> {
    if !domain.kb_path.is_dir() {
        return Err(DomainOsErr::Validation(format!(
            "kb path {} is not a directory",
            domain.kb_path.display()
        )));
    }

    let mut found: Vec<String> = Vec::new();
    let mut pending: Vec<std::path::PathBuf> = vec![domain.kb_path.clone()];
    while let Some(dir) = pending.pop() {
        let mut entries = tokio::fs::read_dir(&dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.is_dir() {
                pending.push(path);
                continue;
            }
            if path.extension().and_then(|e| e.to_str()) != Some("md") {
                continue;
            }
            let Ok(relative) = path.strip_prefix(&domain.kb_path) else {
                continue;
            };
            let relative = relative.to_string_lossy().replace('\\', "/");
            let content = tokio::fs::read_to_string(&path).await?;
            store.upsert_kb_file(&KbFile {
                id: new_id(),
                domain_id: domain.id.clone(),
                relative_path: relative.clone(),
                content_hash: sha256_hex(&content),
                size_bytes: content.len() as u64,
                last_synced_at: now,
                tier: infer_tier(&relative),
                tier_source: TierSource::Inferred,
            })?;
            found.push(relative);
        }
    }

    for indexed in store.list_kb_files(&domain.id)? {
        if !found.contains(&indexed.relative_path) {
            store.remove_kb_file(&domain.id, &indexed.relative_path)?;
        }
    }

    found.sort();
    Ok(found)
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    use super::*;
    use crate::blocks::kb_update::parse_kb_update_blocks;
    use pretty_assertions::assert_eq;

    fn domain(kb_path: &std::path::Path) -> Domain {
        Domain {
            id: "d1".to_string(),
            name: "Ops".to_string(),
            kb_path: kb_path.to_path_buf(),
            identity: String::new(),
            escalation_triggers: vec![],
            allow_gmail: false,
            model_provider: None,
            model_name: None,
            force_tool_attempt: false,
            sort_order: 0,
        }
    }

    /// Accepted block applied to disk, then a scan indexes it with
    /// `content_hash = sha256(new content)`.
    #[tokio::test]
    async fn apply_then_scan_round_trips_content_hash() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open_in_memory().unwrap();
        let domain = domain(dir.path());
        store.upsert_domain(&domain).unwrap();

        let text = "```kb-update\nfile: notes.md\naction: create\nreasoning: start notes\n---\n# Vendor notes\n```\n";
        let parsed = parse_kb_update_blocks(text);
        assert_eq!(parsed.proposals.len(), 1);

        apply_kb_update(&domain, &parsed.proposals[0]).await.unwrap();
        let synced = scan_domain_kb(&store, &domain, Utc::now()).await.unwrap();
        assert_eq!(synced, vec!["notes.md"]);

        let files = store.list_kb_files("d1").unwrap();
        assert_eq!(files[0].content_hash, sha256_hex("# Vendor notes"));
        assert_eq!(files[0].tier, KbTier::General);
    }

    #[tokio::test]
    async fn append_mode_extends_existing_content() {
        let dir = tempfile::tempdir().unwrap();
        let domain = domain(dir.path());
        std::fs::write(dir.path().join("log.md"), "first").unwrap();

        let text = "```kb-update\nfile: log.md\naction: update\nmode: append\nreasoning: add entry\n---\nsecond\n```\n";
        let parsed = parse_kb_update_blocks(text);
        apply_kb_update(&domain, &parsed.proposals[0]).await.unwrap();

        let content = std::fs::read_to_string(dir.path().join("log.md")).unwrap();
        assert_eq!(content, "first\nsecond");
    }

    #[tokio::test]
    async fn scan_drops_deleted_files_and_tiers_specials() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open_in_memory().unwrap();
        let domain = domain(dir.path());
        store.upsert_domain(&domain).unwrap();

        std::fs::write(dir.path().join("claude.md"), "root doc").unwrap();
        std::fs::write(dir.path().join("kb_digest.md"), "digest").unwrap();
        std::fs::create_dir(dir.path().join("sub")).unwrap();
        std::fs::write(dir.path().join("sub/claude.md"), "nested").unwrap();

        scan_domain_kb(&store, &domain, Utc::now()).await.unwrap();
        let files = store.list_kb_files("d1").unwrap();
        let tiers: Vec<(&str, KbTier)> = files
            .iter()
            .map(|f| (f.relative_path.as_str(), f.tier))
            .collect();
        assert_eq!(
            tiers,
            vec![
                ("claude.md", KbTier::Structural),
                ("kb_digest.md", KbTier::Status),
                ("sub/claude.md", KbTier::General),
            ]
        );

        std::fs::remove_file(dir.path().join("kb_digest.md")).unwrap();
        scan_domain_kb(&store, &domain, Utc::now()).await.unwrap();
        assert_eq!(store.list_kb_files("d1").unwrap().len(), 2);
    }
}
