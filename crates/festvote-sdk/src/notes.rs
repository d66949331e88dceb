//! 笔记投影
//!
//! 列表值 = 服务端笔记 ∪ 未同步的离线笔记，按 id 去重（服务端优先），按创建时间倒序。

use std::sync::Arc;

use serde_json::{json, Value};

use crate::error::{FestvoteSDKError, Result};
use crate::remote::{RemoteDataSource, Topic};
use crate::storage::{decode_records, keys, Note, OfflineNote, WriteOperation};
use crate::sync::{merge_by_id_prefer_right, LocalOverlay, Projection};
use crate::utils::now_millis;

/// 离线笔记 id 前缀
pub const OFFLINE_NOTE_PREFIX: &str = "offline-";

/// 在线保存期间临时笔记的 id 前缀，服务端返回后被替换
pub const PENDING_NOTE_PREFIX: &str = "pending-";

/// 校验笔记内容
pub fn validate_content(content: &str) -> Result<&str> {
    let trimmed = content.trim();
    if trimmed.is_empty() {
        return Err(FestvoteSDKError::InvalidArgument("笔记内容不能为空".to_string()));
    }
    Ok(trimmed)
}

/// 新建一条尚未同步的本地笔记
pub fn new_offline_note(author_id: &str, target_id: &str, content: &str) -> OfflineNote {
    OfflineNote {
        id: format!("{}{}", OFFLINE_NOTE_PREFIX, uuid::Uuid::new_v4()),
        target_id: target_id.to_string(),
        content: content.to_string(),
        author_id: author_id.to_string(),
        timestamp: now_millis(),
        synced: false,
    }
}

pub fn is_offline_id(note_id: &str) -> bool {
    note_id.starts_with(OFFLINE_NOTE_PREFIX)
}

pub fn new_pending_id() -> String {
    format!("{}{}", PENDING_NOTE_PREFIX, uuid::Uuid::new_v4())
}

pub fn is_pending_id(note_id: &str) -> bool {
    note_id.starts_with(PENDING_NOTE_PREFIX)
}

/// 插入到列表头部（最新在前）
pub fn insert_note(notes: Option<Vec<Note>>, note: Note) -> Option<Vec<Note>> {
    let mut notes = notes.unwrap_or_default();
    notes.retain(|n| n.id != note.id);
    notes.insert(0, note);
    Some(notes)
}

pub fn remove_note(notes: Option<Vec<Note>>, note_id: &str) -> Option<Vec<Note>> {
    notes.map(|mut notes| {
        notes.retain(|n| n.id != note_id);
        notes
    })
}

/// 用服务端副本替换临时笔记；临时笔记已被移除时不再插回
pub fn replace_note(notes: Option<Vec<Note>>, temp_id: &str, server: &Note) -> Option<Vec<Note>> {
    notes.map(|notes| {
        let mut replaced = false;
        let mut next: Vec<Note> = Vec::with_capacity(notes.len());
        for note in notes {
            if note.id == temp_id {
                replaced = true;
                next.push(server.clone());
            } else if note.id != server.id {
                next.push(note);
            }
        }
        if !replaced {
            tracing::debug!("临时笔记已不在列表中: {}", temp_id);
        }
        next
    })
}

/// `notes:{target}` 的投影
///
/// 排队删除的服务端笔记被隐藏；未同步的离线笔记以 "you (offline)" 署名并入。
pub fn notes_projection(target_id: &str) -> Projection {
    let target_id = target_id.to_string();
    Arc::new(move |rows: Vec<Value>, overlay: &LocalOverlay| -> Result<Value> {
        let deleted: Vec<&str> = overlay
            .pending
            .iter()
            .filter_map(|w| match &w.operation {
                WriteOperation::DeleteNote { note_id, .. } => Some(note_id.as_str()),
                _ => None,
            })
            .collect();

        let mut online: Vec<Note> = decode_records(rows)?;
        online.retain(|n| n.target_id == target_id && !deleted.contains(&n.id.as_str()));

        let offline: Vec<Note> = overlay
            .offline_notes
            .iter()
            .filter(|n| n.target_id == target_id && !n.synced)
            .map(OfflineNote::to_note)
            .collect();

        Ok(serde_json::to_value(merge_by_id_prefer_right(offline, online))?)
    })
}

/// 把离线笔记写到远端，返回服务端副本
pub async fn push_note(remote: &dyn RemoteDataSource, note: &OfflineNote) -> Result<Note> {
    let stored = remote
        .upsert(
            &Topic::new(keys::NOTES),
            json!({
                "target_id": note.target_id,
                "content": note.content,
                "author_id": note.author_id,
            }),
        )
        .await?;
    Ok(serde_json::from_value(stored)?)
}

pub async fn delete_remote_note(remote: &dyn RemoteDataSource, note_id: &str) -> Result<()> {
    remote.remove(&Topic::new(keys::NOTES), note_id).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::MemoryDataSource;
    use crate::storage::{PendingWrite, OFFLINE_AUTHOR_NAME};

    fn server_note(id: &str, created_at: i64) -> Value {
        json!({
            "id": id,
            "target_id": "s1",
            "content": format!("note {}", id),
            "author_id": "u2",
            "author_name": "Sam",
            "created_at": created_at,
        })
    }

    #[test]
    fn test_validate_content() {
        assert!(validate_content("   ").is_err());
        assert_eq!(validate_content("  bring earplugs ").unwrap(), "bring earplugs");
    }

    #[test]
    fn test_pending_and_offline_ids_are_distinct() {
        let pending = new_pending_id();
        assert!(is_pending_id(&pending));
        assert!(!is_offline_id(&pending));
        assert!(!is_pending_id(&new_offline_note("u1", "s1", "x").id));
    }

    #[test]
    fn test_projection_merges_offline_and_hides_deleted() {
        let mut offline = new_offline_note("u1", "s1", "meet at the bar");
        offline.timestamp = 50;
        let mut synced = new_offline_note("u1", "s1", "already confirmed");
        synced.synced = true;

        let overlay = LocalOverlay {
            pending: vec![PendingWrite::new(WriteOperation::DeleteNote {
                note_id: "n2".into(),
                target_id: "s1".into(),
            })],
            offline_notes: vec![offline.clone(), synced],
        };
        let rows = vec![server_note("n1", 10), server_note("n2", 20), server_note("n3", 100)];

        let value = notes_projection("s1")(rows, &overlay).unwrap();
        let notes: Vec<Note> = serde_json::from_value(value).unwrap();
        let ids: Vec<&str> = notes.iter().map(|n| n.id.as_str()).collect();
        assert_eq!(ids, vec!["n3", offline.id.as_str(), "n1"]);
        assert_eq!(notes[1].author_name.as_deref(), Some(OFFLINE_AUTHOR_NAME));
    }

    #[test]
    fn test_replace_temp_note() {
        let temp = new_offline_note("u1", "s1", "hi").to_note();
        let list = insert_note(None, temp.clone());
        let server: Note = serde_json::from_value(server_note("n9", 1)).unwrap();

        let replaced = replace_note(list, &temp.id, &server).unwrap();
        assert_eq!(replaced.len(), 1);
        assert_eq!(replaced[0].id, "n9");

        // 临时笔记已被删除时不插回
        assert!(replace_note(Some(Vec::new()), &temp.id, &server).unwrap().is_empty());
        assert!(remove_note(Some(replaced), "n9").unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_push_note_returns_server_copy() {
        let remote = MemoryDataSource::new();
        let offline = new_offline_note("u1", "s1", "front row");
        let note = push_note(&remote, &offline).await.unwrap();
        assert!(!is_offline_id(&note.id));
        assert_eq!(note.content, "front row");
        assert!(note.synced);

        delete_remote_note(&remote, &note.id).await.unwrap();
        assert!(remote.records(keys::NOTES).is_empty());
    }
}
