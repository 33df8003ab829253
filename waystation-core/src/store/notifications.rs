//! Persisted notifications.

use chrono::Utc;
use rusqlite::{params, Row};
use uuid::Uuid;

use super::db::{from_millis, to_millis, Database};
use crate::error::{Error, Result};
use crate::types::Notification;

fn row_to_notification(row: &Row<'_>) -> rusqlite::Result<Notification> {
    Ok(Notification {
        id: row.get(0)?,
        title: row.get(1)?,
        body: row.get(2)?,
        session_id: row.get(3)?,
        agent_slug: row.get(4)?,
        created_at: from_millis(row.get(5)?),
        read_at: row.get::<_, Option<i64>>(6)?.map(from_millis),
    })
}

impl Database {
    pub fn create_notification(
        &self,
        title: &str,
        body: &str,
        session_id: Option<&str>,
        agent_slug: Option<&str>,
    ) -> Result<Notification> {
        let notification = Notification {
            id: Uuid::new_v4().to_string(),
            title: title.to_string(),
            body: body.to_string(),
            session_id: session_id.map(String::from),
            agent_slug: agent_slug.map(String::from),
            created_at: Utc::now(),
            read_at: None,
        };
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO notifications (id, title, body, session_id, agent_slug, created_at, read_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, NULL)",
                params![
                    notification.id,
                    notification.title,
                    notification.body,
                    notification.session_id,
                    notification.agent_slug,
                    to_millis(notification.created_at),
                ],
            )?;
            Ok(())
        })?;
        Ok(notification)
    }

    pub fn list_notifications(&self, offset: u32, limit: u32) -> Result<Vec<Notification>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, title, body, session_id, agent_slug, created_at, read_at
                 FROM notifications ORDER BY created_at DESC LIMIT ?1 OFFSET ?2",
            )?;
            let notifications = stmt
                .query_map(params![limit, offset], row_to_notification)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(notifications)
        })
    }

    pub fn mark_notification_read(&self, id: &str) -> Result<()> {
        self.with_conn(|conn| {
            let changed = conn.execute(
                "UPDATE notifications SET read_at = ?2 WHERE id = ?1 AND read_at IS NULL",
                params![id, to_millis(Utc::now())],
            )?;
            let exists: i64 = conn.query_row(
                "SELECT count(*) FROM notifications WHERE id = ?1",
                params![id],
                |row| row.get(0),
            )?;
            if changed == 0 && exists == 0 {
                return Err(Error::NotFound(format!("notification {}", id)));
            }
            Ok(())
        })
    }

    pub fn mark_all_notifications_read(&self) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "UPDATE notifications SET read_at = ?1 WHERE read_at IS NULL",
                params![to_millis(Utc::now())],
            )?;
            Ok(())
        })
    }

    pub fn unread_notification_count(&self) -> Result<i64> {
        self.with_conn(|conn| {
            let count = conn.query_row(
                "SELECT count(*) FROM notifications WHERE read_at IS NULL",
                [],
                |row| row.get(0),
            )?;
            Ok(count)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_is_unread() {
        let db = Database::open_in_memory().unwrap();
        let n = db
            .create_notification("Task finished", "daily digest completed", None, Some("a1"))
            .unwrap();
        assert!(n.read_at.is_none());
        assert_eq!(db.unread_notification_count().unwrap(), 1);
    }

    #[test]
    fn test_mark_read_is_idempotent() {
        let db = Database::open_in_memory().unwrap();
        let n = db.create_notification("t", "b", None, None).unwrap();
        db.mark_notification_read(&n.id).unwrap();
        db.mark_notification_read(&n.id).unwrap();
        assert_eq!(db.unread_notification_count().unwrap(), 0);
    }

    #[test]
    fn test_mark_read_missing_is_not_found() {
        let db = Database::open_in_memory().unwrap();
        assert!(db
            .mark_notification_read("missing")
            .unwrap_err()
            .is_not_found());
    }

    #[test]
    fn test_mark_all_read() {
        let db = Database::open_in_memory().unwrap();
        for i in 0..3 {
            db.create_notification(&format!("t{}", i), "b", None, None)
                .unwrap();
        }
        db.mark_all_notifications_read().unwrap();
        assert_eq!(db.unread_notification_count().unwrap(), 0);
    }

    #[test]
    fn test_listing_newest_first() {
        let db = Database::open_in_memory().unwrap();
        db.create_notification("first", "b", None, None).unwrap();
        db.create_notification("second", "b", None, None).unwrap();
        let list = db.list_notifications(0, 10).unwrap();
        assert_eq!(list.len(), 2);
    }
}
