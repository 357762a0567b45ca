use level_notify::backend::{NotificationBackend, StaticAuth};
use level_notify::chime::SilentChime;
use level_notify::db::{self, NewNotification, Profile, SqliteBackend};
use level_notify::model::{Level, MarkerLookup, Role, TargetLevel};
use level_notify::reconciler::{MarkOutcome, NotificationFeed, Reconciler};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

struct Fixture {
    _dir: TempDir,
    backend: Arc<SqliteBackend>,
    teacher: Profile,
}

async fn setup() -> Fixture {
    let dir = tempfile::tempdir().unwrap();
    let url = format!("sqlite://{}", dir.path().join("notify.db").display());
    let pool = db::init_pool(&url).await.unwrap();
    db::run_migrations(&pool).await.unwrap();
    let teacher = db::create_profile(&pool, "Dr. Michael Chen", Role::Teacher, None)
        .await
        .unwrap();
    Fixture {
        _dir: dir,
        backend: Arc::new(SqliteBackend::new(pool, Duration::from_millis(10))),
        teacher,
    }
}

impl Fixture {
    async fn student(&self, level: Level) -> Profile {
        db::create_profile(self.backend.pool(), "Sarah Johnson", Role::Student, Some(level))
            .await
            .unwrap()
    }

    async fn publish(&self, title: &str, target: TargetLevel) -> String {
        let new = NewNotification {
            title: title.into(),
            message: format!("{title} is available"),
            target_level: target,
            content_id: Some(format!("content-{title}")),
        };
        db::publish_notification(self.backend.pool(), &self.teacher.id, &new)
            .await
            .unwrap()
            .id
    }

    fn reconciler(&self, profile: &Profile) -> Reconciler {
        Reconciler::new(
            self.backend.clone(),
            Arc::new(StaticAuth::signed_in(profile.as_current_user())),
            Arc::new(SilentChime),
        )
    }
}

fn titles(feed: &NotificationFeed) -> Vec<&str> {
    feed.notifications
        .iter()
        .map(|v| v.notification.title.as_str())
        .collect()
}

#[tokio::test]
async fn fetch_and_mark_against_sqlite() {
    let fx = setup().await;
    let sarah = fx.student(Level::L200).await;
    fx.publish("welcome", TargetLevel::All).await;
    fx.publish("anatomy notes", TargetLevel::Level(Level::L200)).await;
    fx.publish("pharmacology", TargetLevel::Level(Level::L300)).await;

    let reconciler = fx.reconciler(&sarah);
    reconciler.fetch().await.unwrap();
    let feed = reconciler.snapshot().await;
    assert_eq!(titles(&feed), vec!["anatomy notes", "welcome"]);
    assert_eq!(feed.unread_count, 2);
    assert_eq!(
        feed.notifications[0].notification.content_id.as_deref(),
        Some("content-anatomy notes")
    );

    let target = feed.notifications[0].clone();
    let MarkOutcome::Marked { marker_id } = reconciler.mark_as_read(&target).await.unwrap()
    else {
        panic!("expected a new marker");
    };
    assert_eq!(
        db::count_read_markers(fx.backend.pool(), &sarah.id, target.id())
            .await
            .unwrap(),
        1
    );
    reconciler.teardown().await;

    // A fresh session sees the persisted read state.
    let again = fx.reconciler(&sarah);
    again.fetch().await.unwrap();
    let feed = again.snapshot().await;
    assert_eq!(feed.unread_count, 1);
    let marked = &feed.notifications[0];
    assert!(marked.is_read);
    assert_eq!(marked.marker, MarkerLookup::Existing(marker_id.clone()));
    assert_eq!(marked.marker.marker_id(), Some(marker_id.as_str()));

    assert_eq!(
        again.mark_as_read(marked).await.unwrap(),
        MarkOutcome::AlreadyRead
    );
    assert_eq!(
        db::count_read_markers(fx.backend.pool(), &sarah.id, target.id())
            .await
            .unwrap(),
        1
    );
}

#[tokio::test]
async fn fetch_is_bounded_to_newest() {
    let fx = setup().await;
    let sarah = fx.student(Level::L100).await;
    for i in 0..7 {
        fx.publish(&format!("item {i}"), TargetLevel::All).await;
    }

    let reconciler = fx.reconciler(&sarah).with_fetch_limit(5);
    reconciler.fetch().await.unwrap();
    let feed = reconciler.snapshot().await;
    assert_eq!(
        titles(&feed),
        vec!["item 6", "item 5", "item 4", "item 3", "item 2"]
    );
}

#[tokio::test]
async fn live_feed_delivers_matching_inserts() {
    let fx = setup().await;
    let sarah = fx.student(Level::L200).await;
    fx.publish("before", TargetLevel::All).await;

    let reconciler = fx.reconciler(&sarah);
    reconciler.fetch().await.unwrap();
    reconciler.activate().await.unwrap();
    assert_eq!(fx.backend.active_subscriptions(), 1);

    fx.publish("third years", TargetLevel::Level(Level::L300)).await;
    fx.publish("second years", TargetLevel::Level(Level::L200)).await;

    let feed = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let feed = reconciler.snapshot().await;
            if feed.notifications.len() == 2 {
                return feed;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("live insert not delivered");

    assert_eq!(titles(&feed), vec!["second years", "before"]);
    assert!(!feed.notifications[0].is_read);
    assert_eq!(feed.notifications[0].marker, MarkerLookup::Absent);
    assert_eq!(feed.unread_count, 2);

    reconciler.teardown().await;
    assert_eq!(fx.backend.active_subscriptions(), 0);
}

#[tokio::test]
async fn dropped_subscription_stops_its_poller() {
    let fx = setup().await;
    let subscription = fx.backend.subscribe_inserts().await.unwrap();
    assert_eq!(fx.backend.active_subscriptions(), 1);

    drop(subscription);
    tokio::time::timeout(Duration::from_secs(5), async {
        while fx.backend.active_subscriptions() != 0 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("poller still registered after its subscriber went away");
}
