use super::model::{NewNotification, Profile};
use crate::model::{BroadcastNotification, Level, ReadMarker, Role};
use anyhow::{anyhow, bail, Context, Result};
use chrono::Utc;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use tracing::instrument;
use uuid::Uuid;

pub type Pool = SqlitePool;

const NOTIFICATION_COLUMNS: &str =
    "seq, id, title, message, target_level, content_id, created_at";

pub async fn init_pool(database_url: &str) -> Result<Pool> {
    let normalized = prepare_sqlite_url(database_url);
    let pool = SqlitePool::connect(&normalized)
        .await
        .with_context(|| format!("failed to open database {normalized}"))?;
    sqlx::query("PRAGMA journal_mode=WAL;")
        .execute(&pool)
        .await?;
    Ok(pool)
}

/// Expand a leading `~/` in a file-backed SQLite URL, create its parent
/// directory and create the file on first use. Other URLs pass through.
fn prepare_sqlite_url(url: &str) -> String {
    let Some(rest) = url.strip_prefix("sqlite:") else {
        return url.to_string();
    };
    if rest.starts_with(":memory") {
        return url.to_string();
    }

    let rest = rest.strip_prefix("//").unwrap_or(rest);
    let (path, query) = match rest.split_once('?') {
        Some((p, q)) => (p, Some(q)),
        None => (rest, None),
    };
    if path.is_empty() {
        return url.to_string();
    }

    let path = match (path.strip_prefix("~/"), std::env::var("HOME")) {
        (Some(tail), Ok(home)) => format!("{}/{}", home.trim_end_matches('/'), tail),
        _ => path.to_string(),
    };
    if let Some(parent) = std::path::Path::new(&path).parent() {
        if !parent.as_os_str().is_empty() {
            let _ = std::fs::create_dir_all(parent);
        }
    }

    match query {
        Some(q) => format!("sqlite://{path}?{q}"),
        None => format!("sqlite://{path}?mode=rwc"),
    }
}

pub async fn run_migrations(pool: &Pool) -> Result<()> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}

fn profile_from_row(row: &SqliteRow) -> Result<Profile> {
    let role: String = row.get("role");
    let level: Option<String> = row.get("level");
    Ok(Profile {
        id: row.get("id"),
        full_name: row.get("full_name"),
        role: role.parse()?,
        level: level.as_deref().map(str::parse::<Level>).transpose()?,
        created_at: row.get("created_at"),
    })
}

fn notification_from_row(row: &SqliteRow) -> Result<BroadcastNotification> {
    let id: String = row.get("id");
    let target: String = row.get("target_level");
    Ok(BroadcastNotification {
        target_level: target
            .parse()
            .with_context(|| format!("notification {id} has a bad target level"))?,
        id,
        title: row.get("title"),
        message: row.get("message"),
        content_id: row.get("content_id"),
        created_at: row.get("created_at"),
    })
}

fn marker_from_row(row: &SqliteRow) -> ReadMarker {
    ReadMarker {
        id: row.get("id"),
        user_id: row.get("user_id"),
        notification_id: row.get("notification_id"),
        read: row.get("read"),
    }
}

#[instrument(skip_all)]
pub async fn create_profile(
    pool: &Pool,
    full_name: &str,
    role: Role,
    level: Option<Level>,
) -> Result<Profile> {
    if full_name.trim().is_empty() {
        bail!("full name must be non-empty");
    }
    // Only students carry a level.
    let level = match role {
        Role::Student => Some(level.ok_or_else(|| anyhow!("students need a level"))?),
        Role::Teacher => None,
    };
    let profile = Profile {
        id: Uuid::new_v4().to_string(),
        full_name: full_name.trim().to_string(),
        role,
        level,
        created_at: Utc::now(),
    };
    sqlx::query(
        "INSERT INTO profiles (id, full_name, role, level, created_at) VALUES (?, ?, ?, ?, ?)",
    )
    .bind(&profile.id)
    .bind(&profile.full_name)
    .bind(profile.role.as_str())
    .bind(profile.level.map(|l| l.as_str()))
    .bind(profile.created_at)
    .execute(pool)
    .await?;
    Ok(profile)
}

#[instrument(skip_all)]
pub async fn get_profile(pool: &Pool, id: &str) -> Result<Option<Profile>> {
    let row = sqlx::query("SELECT id, full_name, role, level, created_at FROM profiles WHERE id = ?")
        .bind(id)
        .fetch_optional(pool)
        .await?;
    row.as_ref().map(profile_from_row).transpose()
}

/// Teacher-side publish. Students cannot broadcast.
#[instrument(skip_all)]
pub async fn publish_notification(
    pool: &Pool,
    author_id: &str,
    new: &NewNotification,
) -> Result<BroadcastNotification> {
    let author = get_profile(pool, author_id)
        .await?
        .ok_or_else(|| anyhow!("unknown profile {author_id}"))?;
    if author.role != Role::Teacher {
        bail!("only teachers can publish notifications");
    }
    if new.title.trim().is_empty() {
        bail!("notification title must be non-empty");
    }

    let notification = BroadcastNotification {
        id: Uuid::new_v4().to_string(),
        title: new.title.trim().to_string(),
        message: new.message.clone(),
        target_level: new.target_level,
        created_at: Utc::now(),
        content_id: new.content_id.clone(),
    };
    sqlx::query(
        "INSERT INTO notifications (id, title, message, target_level, content_id, created_by, created_at) VALUES (?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(&notification.id)
    .bind(&notification.title)
    .bind(&notification.message)
    .bind(notification.target_level.as_str())
    .bind(&notification.content_id)
    .bind(author_id)
    .bind(notification.created_at)
    .execute(pool)
    .await?;
    Ok(notification)
}

/// Newest first; rows written in the same instant keep insertion order.
#[instrument(skip_all)]
pub async fn list_notifications(pool: &Pool, limit: u32) -> Result<Vec<BroadcastNotification>> {
    let rows = sqlx::query(&format!(
        "SELECT {NOTIFICATION_COLUMNS} FROM notifications ORDER BY created_at DESC, seq DESC LIMIT ?"
    ))
    .bind(i64::from(limit))
    .fetch_all(pool)
    .await?;
    rows.iter().map(notification_from_row).collect()
}

/// Notifications inserted after the `seq` cursor, oldest first.
pub async fn notifications_after(
    pool: &Pool,
    seq: i64,
) -> Result<Vec<(i64, BroadcastNotification)>> {
    let rows = sqlx::query(&format!(
        "SELECT {NOTIFICATION_COLUMNS} FROM notifications WHERE seq > ? ORDER BY seq ASC"
    ))
    .bind(seq)
    .fetch_all(pool)
    .await?;
    rows.iter()
        .map(|row| -> Result<(i64, BroadcastNotification)> {
            Ok((row.get("seq"), notification_from_row(row)?))
        })
        .collect()
}

pub async fn max_notification_seq(pool: &Pool) -> Result<i64> {
    let seq: Option<i64> = sqlx::query_scalar("SELECT MAX(seq) FROM notifications")
        .fetch_one(pool)
        .await?;
    Ok(seq.unwrap_or(0))
}

#[instrument(skip_all)]
pub async fn list_read_markers(pool: &Pool, user_id: &str) -> Result<Vec<ReadMarker>> {
    let rows = sqlx::query(
        "SELECT id, user_id, notification_id, read FROM user_notifications WHERE user_id = ?",
    )
    .bind(user_id)
    .fetch_all(pool)
    .await?;
    Ok(rows.iter().map(marker_from_row).collect())
}

/// Insert a marker. Fails if one already exists for the pair.
#[instrument(skip_all)]
pub async fn insert_read_marker(
    pool: &Pool,
    user_id: &str,
    notification_id: &str,
    read: bool,
) -> Result<ReadMarker> {
    let marker = ReadMarker {
        id: Uuid::new_v4().to_string(),
        user_id: user_id.to_string(),
        notification_id: notification_id.to_string(),
        read,
    };
    sqlx::query(
        "INSERT INTO user_notifications (id, user_id, notification_id, read, created_at) VALUES (?, ?, ?, ?, ?)",
    )
    .bind(&marker.id)
    .bind(&marker.user_id)
    .bind(&marker.notification_id)
    .bind(marker.read)
    .bind(Utc::now())
    .execute(pool)
    .await
    .with_context(|| format!("failed to insert read marker for {notification_id}"))?;
    Ok(marker)
}

#[instrument(skip_all)]
pub async fn update_read_marker(pool: &Pool, marker_id: &str, read: bool) -> Result<()> {
    let done = sqlx::query("UPDATE user_notifications SET read = ? WHERE id = ?")
        .bind(read)
        .bind(marker_id)
        .execute(pool)
        .await?;
    if done.rows_affected() == 0 {
        bail!("no read marker {marker_id}");
    }
    Ok(())
}

pub async fn count_read_markers(pool: &Pool, user_id: &str, notification_id: &str) -> Result<i64> {
    let cnt: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM user_notifications WHERE user_id = ? AND notification_id = ?",
    )
    .bind(user_id)
    .bind(notification_id)
    .fetch_one(pool)
    .await?;
    Ok(cnt)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::TargetLevel;

    async fn setup_pool() -> Pool {
        let pool = SqlitePool::connect("sqlite::memory:").await.unwrap();
        sqlx::migrate!("./migrations").run(&pool).await.unwrap();
        pool
    }

    fn new_notification(title: &str, target: TargetLevel) -> NewNotification {
        NewNotification {
            title: title.into(),
            message: format!("{title} body"),
            target_level: target,
            content_id: None,
        }
    }

    #[test]
    fn sqlite_url_normalization() {
        assert_eq!(prepare_sqlite_url("sqlite::memory:"), "sqlite::memory:");
        assert_eq!(
            prepare_sqlite_url("postgres://localhost/db"),
            "postgres://localhost/db"
        );
        let td = tempfile::tempdir().unwrap();
        let nested = td.path().join("a/b/notify.db");
        let url = format!("sqlite://{}", nested.display());
        assert_eq!(
            prepare_sqlite_url(&url),
            format!("sqlite://{}?mode=rwc", nested.display())
        );
        assert!(nested.parent().unwrap().exists());
    }

    #[tokio::test]
    async fn profiles_round_trip() {
        let pool = setup_pool().await;
        let student = create_profile(&pool, "Sarah", Role::Student, Some(Level::L200))
            .await
            .unwrap();
        let teacher = create_profile(&pool, "Dr. Chen", Role::Teacher, Some(Level::L100))
            .await
            .unwrap();
        assert_eq!(teacher.level, None);

        let loaded = get_profile(&pool, &student.id).await.unwrap().unwrap();
        assert_eq!(loaded.level, Some(Level::L200));
        assert_eq!(loaded.role, Role::Student);
        assert!(get_profile(&pool, "missing").await.unwrap().is_none());

        assert!(create_profile(&pool, "No Level", Role::Student, None)
            .await
            .is_err());
    }

    #[tokio::test]
    async fn only_teachers_publish() {
        let pool = setup_pool().await;
        let student = create_profile(&pool, "Sarah", Role::Student, Some(Level::L100))
            .await
            .unwrap();
        let err = publish_notification(&pool, &student.id, &new_notification("Hi", TargetLevel::All))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("only teachers"));
    }

    #[tokio::test]
    async fn notifications_newest_first_with_limit() {
        let pool = setup_pool().await;
        let teacher = create_profile(&pool, "Dr. Chen", Role::Teacher, None)
            .await
            .unwrap();
        for i in 0..5 {
            publish_notification(&pool, &teacher.id, &new_notification(&format!("n{i}"), TargetLevel::All))
                .await
                .unwrap();
        }

        let listed = list_notifications(&pool, 3).await.unwrap();
        let titles: Vec<_> = listed.iter().map(|n| n.title.as_str()).collect();
        assert_eq!(titles, vec!["n4", "n3", "n2"]);

        let after = notifications_after(&pool, 3).await.unwrap();
        let titles: Vec<_> = after.iter().map(|(_, n)| n.title.as_str()).collect();
        assert_eq!(titles, vec!["n3", "n4"]);
        assert_eq!(max_notification_seq(&pool).await.unwrap(), 5);
    }

    #[tokio::test]
    async fn read_markers_are_unique_per_pair() {
        let pool = setup_pool().await;
        let teacher = create_profile(&pool, "Dr. Chen", Role::Teacher, None)
            .await
            .unwrap();
        let n = publish_notification(&pool, &teacher.id, &new_notification("A", TargetLevel::All))
            .await
            .unwrap();

        let marker = insert_read_marker(&pool, "u1", &n.id, false).await.unwrap();
        assert!(insert_read_marker(&pool, "u1", &n.id, true).await.is_err());
        assert_eq!(count_read_markers(&pool, "u1", &n.id).await.unwrap(), 1);

        update_read_marker(&pool, &marker.id, true).await.unwrap();
        let markers = list_read_markers(&pool, "u1").await.unwrap();
        assert_eq!(markers.len(), 1);
        assert!(markers[0].read);
        assert!(list_read_markers(&pool, "u2").await.unwrap().is_empty());

        assert!(update_read_marker(&pool, "missing", true).await.is_err());
    }
}
