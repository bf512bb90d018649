use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use krypton_misc::api::entry::{ClipboardEntry, ContentType, NewEntry, MAX_PREVIEW_CHARS};
use krypton_misc::code;
use krypton_misc::dirs::ensure_dir_exists;
use krypton_misc::time::{millis_before_days, now_millis};
use log::{info, warn};
use uuid::Uuid;

use crate::db::types::EntryQuery;
use crate::db::Database;

/// Per-user clipboard log. All reads come back newest first; ownership
/// checks are folded into every lookup so one user can never touch
/// another's entries.
pub struct ClipboardStore {
    db: Arc<Database>,

    /// When set, image bytes are written below this root and the database
    /// row only keeps the path.
    images_root: Option<PathBuf>,
}

impl ClipboardStore {
    pub const DEFAULT_LIMIT: u64 = 100;

    pub fn new(db: Arc<Database>, images_root: Option<PathBuf>) -> Self {
        Self { db, images_root }
    }

    pub fn push(&self, user_id: &str, req: NewEntry) -> Result<ClipboardEntry> {
        let now = now_millis();
        let hash = code::sha256(&req.content);
        let preview = match req.preview {
            Some(preview) => truncate_preview(&preview),
            None => generate_preview(req.content_type, &req.content),
        };

        let id = Uuid::new_v4().to_string();
        let mut content = req.content;
        let mut external_path = None;
        if req.content_type == ContentType::Image {
            if let Some(ref root) = self.images_root {
                let path = self
                    .write_image(root, user_id, &content)
                    .context("write image blob")?;
                external_path = Some(path);
                content = Vec::new();
            }
        }

        let entry = ClipboardEntry {
            id,
            user_id: user_id.to_string(),
            content_type: req.content_type,
            content,
            preview,
            hash,
            source_device: req.source_device,
            create_time: now,
            external_path,
        };

        let result = self.db.with_transaction(|tx| tx.create_entry(&entry));
        if result.is_err() {
            // Do not leave an orphan blob behind a failed insert.
            if let Some(ref path) = entry.external_path {
                self.remove_blob(path);
            }
        }
        result?;

        Ok(entry)
    }

    pub fn history(
        &self,
        user_id: &str,
        limit: u64,
        offset: u64,
    ) -> Result<(Vec<ClipboardEntry>, u64, bool)> {
        let limit = clamp_limit(limit);
        self.db.with_transaction(|tx| {
            let query = EntryQuery {
                user_id: Some(user_id.to_string()),
                limit: Some(limit),
                offset: Some(offset),
                ..Default::default()
            };
            let total = tx.count_entries(&query)?;
            let entries = tx.get_entries(&query)?;
            let has_more = (offset + entries.len() as u64) < total;
            Ok((entries, total, has_more))
        })
    }

    pub fn search(
        &self,
        user_id: &str,
        search: &str,
        limit: u64,
    ) -> Result<(Vec<ClipboardEntry>, u64, bool)> {
        let limit = clamp_limit(limit);
        self.db.with_transaction(|tx| {
            let query = EntryQuery {
                user_id: Some(user_id.to_string()),
                search: Some(search.to_string()),
                limit: Some(limit),
                ..Default::default()
            };
            let total = tx.count_entries(&query)?;
            let entries = tx.get_entries(&query)?;
            let has_more = (entries.len() as u64) < total;
            Ok((entries, total, has_more))
        })
    }

    /// Refreshes the entry timestamp so it sorts first. Returns false when
    /// the entry does not exist or belongs to another user.
    pub fn move_to_top(&self, user_id: &str, entry_id: &str) -> Result<bool> {
        self.db
            .with_transaction(|tx| tx.update_entry_time(user_id, entry_id, now_millis()))
    }

    /// Deletes the entry and its external blob, if any. Returns false when
    /// the entry does not exist or belongs to another user.
    pub fn delete(&self, user_id: &str, entry_id: &str) -> Result<bool> {
        let deleted = self.db.with_transaction(|tx| {
            let entry = tx.get_entry(user_id, entry_id)?;
            if entry.is_some() {
                tx.delete_entry(user_id, entry_id)?;
            }
            Ok(entry)
        })?;

        match deleted {
            Some(entry) => {
                if let Some(ref path) = entry.external_path {
                    self.remove_blob(path);
                }
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Bulk-deletes entries older than `days`, optionally restricted to a
    /// single content type, and removes their external blobs. Returns the
    /// number of deleted rows.
    pub fn cleanup_older_than(&self, days: u64, content_type: Option<ContentType>) -> Result<u64> {
        let before = millis_before_days(days);
        let (count, paths) = self.db.with_transaction(|tx| {
            let query = EntryQuery {
                create_before: Some(before),
                content_type: content_type.map(|ct| ct.to_code()),
                ..Default::default()
            };
            let entries = tx.get_entries(&query)?;
            let ids: Vec<_> = entries.iter().map(|e| e.id.clone()).collect();
            let paths: Vec<_> = entries.iter().filter_map(|e| e.external_path.clone()).collect();

            let count = tx.delete_entries(ids)?;
            Ok((count, paths))
        })?;

        for path in paths {
            self.remove_blob(&path);
        }
        if count > 0 {
            info!("Cleanup removed {count} entries older than {days}d");
        }

        Ok(count)
    }

    /// Counts the entries a cleanup run would delete, without touching
    /// anything. Used by `cleanup --dry-run`.
    pub fn count_older_than(&self, days: u64) -> Result<u64> {
        let before = millis_before_days(days);
        self.db.with_transaction(|tx| {
            tx.count_entries(&EntryQuery {
                create_before: Some(before),
                ..Default::default()
            })
        })
    }

    fn write_image(&self, root: &Path, user_id: &str, content: &[u8]) -> Result<String> {
        let dir = root.join("images").join(user_id);
        ensure_dir_exists(&dir)?;
        // Blob names are fresh uuids, so concurrent writers can never
        // collide on a path.
        let path = dir.join(format!("{}.png", Uuid::new_v4()));
        fs::write(&path, content).with_context(|| format!("write {}", path.display()))?;
        Ok(format!("{}", path.display()))
    }

    fn remove_blob(&self, path: &str) {
        match fs::remove_file(path) {
            Ok(()) => {}
            // Already gone, nothing to do.
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(err) => warn!("Failed to remove blob {path}: {err:#}"),
        }
    }
}

fn clamp_limit(limit: u64) -> u64 {
    if limit == 0 {
        ClipboardStore::DEFAULT_LIMIT
    } else {
        limit
    }
}

fn generate_preview(content_type: ContentType, content: &[u8]) -> String {
    match content_type {
        ContentType::Text => {
            let text = String::from_utf8_lossy(content);
            truncate_preview(&text)
        }
        ContentType::Image => String::from("[Image]"),
        ContentType::File => String::from("[File]"),
    }
}

fn truncate_preview(text: &str) -> String {
    let text = text.replace('\n', " ");

    let mut result = String::new();
    let mut chars = 0;
    for c in text.chars() {
        if chars == MAX_PREVIEW_CHARS {
            result.push_str("...");
            return result;
        }
        result.push(c);
        chars += 1;
    }

    result
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::path::PathBuf;

    use krypton_misc::code::sha256;

    use crate::context::ServerContext;

    use super::*;

    fn text_entry(content: &str) -> NewEntry {
        NewEntry {
            content_type: ContentType::Text,
            content: content.as_bytes().to_vec(),
            preview: None,
            source_device: Some(String::from("test-device")),
        }
    }

    #[test]
    fn test_push_and_history() {
        let ctx = ServerContext::new_test();

        let entry = ctx.store.push("u1", text_entry("hello")).unwrap();
        assert_eq!(entry.hash, sha256("hello"));
        assert_eq!(entry.preview, "hello");
        assert!(!entry.id.is_empty());

        ctx.store.push("u1", text_entry("world")).unwrap();
        ctx.store.push("u2", text_entry("other user")).unwrap();

        let (entries, total, has_more) = ctx.store.history("u1", 10, 0).unwrap();
        assert_eq!(total, 2);
        assert!(!has_more);
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].content, b"world");
        assert_eq!(entries[1].content, b"hello");

        let (entries, total, has_more) = ctx.store.history("u1", 1, 0).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(total, 2);
        assert!(has_more);

        let (entries, total, has_more) = ctx.store.history("u1", 1, 1).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(total, 2);
        assert!(!has_more);
    }

    #[test]
    fn test_preview_generation() {
        let ctx = ServerContext::new_test();

        let long = "x".repeat(300);
        let entry = ctx.store.push("u1", text_entry(&long)).unwrap();
        assert_eq!(entry.preview.chars().count(), MAX_PREVIEW_CHARS + 3);
        assert!(entry.preview.ends_with("..."));

        let entry = ctx
            .store
            .push(
                "u1",
                NewEntry {
                    content_type: ContentType::Text,
                    content: b"line one\nline two".to_vec(),
                    preview: None,
                    source_device: None,
                },
            )
            .unwrap();
        assert_eq!(entry.preview, "line one line two");

        let entry = ctx
            .store
            .push(
                "u1",
                NewEntry {
                    content_type: ContentType::Image,
                    content: vec![0u8; 64],
                    preview: None,
                    source_device: None,
                },
            )
            .unwrap();
        assert_eq!(entry.preview, "[Image]");

        let entry = ctx
            .store
            .push(
                "u1",
                NewEntry {
                    content_type: ContentType::File,
                    content: vec![1u8; 16],
                    preview: Some(String::from("notes.txt")),
                    source_device: None,
                },
            )
            .unwrap();
        assert_eq!(entry.preview, "notes.txt");
    }

    #[test]
    fn test_search() {
        let ctx = ServerContext::new_test();
        ctx.store.push("u1", text_entry("Hello World")).unwrap();
        ctx.store.push("u1", text_entry("hello again")).unwrap();
        ctx.store.push("u1", text_entry("something else")).unwrap();

        let (entries, total, has_more) = ctx.store.search("u1", "hello", 10).unwrap();
        assert_eq!(total, 2);
        assert_eq!(entries.len(), 2);
        assert!(!has_more);

        let (entries, total, has_more) = ctx.store.search("u1", "hello", 1).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(total, 2);
        assert!(has_more);

        let (entries, _, _) = ctx.store.search("u2", "hello", 10).unwrap();
        assert!(entries.is_empty());
    }

    #[test]
    fn test_move_to_top() {
        let ctx = ServerContext::new_test();
        let first = ctx.store.push("u1", text_entry("first")).unwrap();
        ctx.store.push("u1", text_entry("second")).unwrap();

        let (entries, _, _) = ctx.store.history("u1", 10, 0).unwrap();
        assert_eq!(entries[0].content, b"second");

        assert!(ctx.store.move_to_top("u1", &first.id).unwrap());
        let (entries, _, _) = ctx.store.history("u1", 10, 0).unwrap();
        assert_eq!(entries[0].content, b"first");

        // Not the owner, not found.
        assert!(!ctx.store.move_to_top("u2", &first.id).unwrap());
        assert!(!ctx.store.move_to_top("u1", "missing").unwrap());
    }

    #[test]
    fn test_delete() {
        let ctx = ServerContext::new_test();
        let entry = ctx.store.push("u1", text_entry("to delete")).unwrap();

        assert!(!ctx.store.delete("u2", &entry.id).unwrap());
        assert!(ctx.store.delete("u1", &entry.id).unwrap());
        assert!(!ctx.store.delete("u1", &entry.id).unwrap());

        let (_, total, _) = ctx.store.history("u1", 10, 0).unwrap();
        assert_eq!(total, 0);
    }

    #[test]
    fn test_external_images() {
        let root = PathBuf::from("testdata/store_images");
        let _ = fs::remove_dir_all(&root);
        fs::create_dir_all(&root).unwrap();
        let ctx = ServerContext::new_test_with_images(root.clone());

        let image = vec![0x89u8; 128];
        let entry = ctx
            .store
            .push(
                "u1",
                NewEntry {
                    content_type: ContentType::Image,
                    content: image.clone(),
                    preview: None,
                    source_device: None,
                },
            )
            .unwrap();

        assert!(entry.content.is_empty());
        let path = entry.external_path.clone().unwrap();
        assert!(path.contains("images"));
        assert_eq!(fs::read(&path).unwrap(), image);

        // Deleting the row removes the blob too.
        assert!(ctx.store.delete("u1", &entry.id).unwrap());
        assert!(!PathBuf::from(&path).exists());

        fs::remove_dir_all(&root).unwrap();
    }

    #[test]
    fn test_cleanup_older_than() {
        let root = PathBuf::from("testdata/store_cleanup");
        let _ = fs::remove_dir_all(&root);
        fs::create_dir_all(&root).unwrap();
        let ctx = ServerContext::new_test_with_images(root.clone());

        let old_image = ctx
            .store
            .push(
                "u1",
                NewEntry {
                    content_type: ContentType::Image,
                    content: vec![1u8; 32],
                    preview: None,
                    source_device: None,
                },
            )
            .unwrap();
        let old_text = ctx.store.push("u1", text_entry("old text")).unwrap();
        let fresh = ctx.store.push("u1", text_entry("fresh")).unwrap();

        // Backdate two of the entries by 40 days.
        let backdate = millis_before_days(40);
        ctx.db
            .with_transaction(|tx| {
                assert!(tx.update_entry_time("u1", &old_image.id, backdate)?);
                assert!(tx.update_entry_time("u1", &old_text.id, backdate + 1)?);
                Ok(())
            })
            .unwrap();

        assert_eq!(ctx.store.count_older_than(30).unwrap(), 2);
        let deleted = ctx.store.cleanup_older_than(30, None).unwrap();
        assert_eq!(deleted, 2);

        let (entries, total, _) = ctx.store.history("u1", 10, 0).unwrap();
        assert_eq!(total, 1);
        assert_eq!(entries[0].id, fresh.id);

        // The evicted image blob is gone from disk.
        let path = old_image.external_path.unwrap();
        assert!(!PathBuf::from(&path).exists());

        fs::remove_dir_all(&root).unwrap();
    }

    #[test]
    fn test_cleanup_image_only() {
        let ctx = ServerContext::new_test();

        let old_text = ctx.store.push("u1", text_entry("old text")).unwrap();
        let old_image = ctx
            .store
            .push(
                "u1",
                NewEntry {
                    content_type: ContentType::Image,
                    content: vec![2u8; 16],
                    preview: None,
                    source_device: None,
                },
            )
            .unwrap();

        let backdate = millis_before_days(10);
        ctx.db
            .with_transaction(|tx| {
                tx.update_entry_time("u1", &old_text.id, backdate)?;
                tx.update_entry_time("u1", &old_image.id, backdate)?;
                Ok(())
            })
            .unwrap();

        let deleted = ctx
            .store
            .cleanup_older_than(7, Some(ContentType::Image))
            .unwrap();
        assert_eq!(deleted, 1);

        let (entries, _, _) = ctx.store.history("u1", 10, 0).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].id, old_text.id);
    }
}
