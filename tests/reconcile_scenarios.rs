//! End-to-end scenarios: config store, feature tasks, reconciler, role buttons
//! and the dashboard wired together against the in-memory platform.

use axum::body::Body;
use axum::http::{Request, StatusCode};
use ranger::components::{ButtonClick, ComponentRegistry, GrantOutcome, RoleButtonHandler};
use ranger::dashboard::{create_router, DashboardState};
use ranger::features::managed::{ManagedMessages, PollOutcome, EMBED_MESSAGE, ROLE_BUTTONS};
use ranger::features::{Feature, FeatureRegistry};
use ranger::platform::memory::{MemoryPlatform, WriteOp};
use ranger::platform::ChatPlatform;
use ranger::reconcile::Reconciler;
use ranger::store::ConfigStore;
use serde_json::{json, Value};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tower::ServiceExt;

const GUILD: u64 = 1;

struct Bot {
    _dir: TempDir,
    store: ConfigStore,
    platform: Arc<MemoryPlatform>,
    components: Arc<ComponentRegistry>,
    registry: FeatureRegistry,
    features: Vec<Arc<ManagedMessages>>,
}

async fn write(path: &Path, value: &Value) {
    tokio::fs::create_dir_all(path.parent().unwrap()).await.unwrap();
    tokio::fs::write(path, value.to_string()).await.unwrap();
}

async fn start_bot(embeds: Value, buttons: Value) -> Bot {
    let dir = TempDir::new().unwrap();
    let store = ConfigStore::new(dir.path());
    for name in [EMBED_MESSAGE, ROLE_BUTTONS] {
        write(&store.schema_path(name), &json!({"type": "object"})).await;
    }
    write(&store.config_path(EMBED_MESSAGE), &embeds).await;
    write(&store.config_path(ROLE_BUTTONS), &buttons).await;

    let platform = Arc::new(MemoryPlatform::new());
    platform.add_channel(GUILD, 1, "welcome");
    platform.add_channel(GUILD, 2, "roles");
    platform.add_guild_role(GUILD, 100, "Gamer", true);
    platform.add_guild_role(GUILD, 200, "Artist", false);

    let components = Arc::new(ComponentRegistry::new());
    let mut registry = FeatureRegistry::new();
    let mut features = Vec::new();
    for name in [EMBED_MESSAGE, ROLE_BUTTONS] {
        let reconciler = Reconciler::new(name, GUILD, platform.clone(), components.clone());
        let feature = Arc::new(ManagedMessages::spawn(
            name,
            store.clone(),
            reconciler,
            Duration::from_secs(3600),
        ));
        registry.register(feature.clone());
        features.push(feature);
    }
    registry.load_all().await.unwrap();

    Bot {
        _dir: dir,
        store,
        platform,
        components,
        registry,
        features,
    }
}

fn hello() -> Value {
    json!({"channels":[{"id":"1","groups":[{"disabled":false,"message":{"content":"hi","embeds":[]}}]}]})
}

fn panel() -> Value {
    json!({"channels":[{"id":"2","groups":[{"message":{
        "content": "Pick your roles",
        "buttons": {"count": true, "list": [
            {"label": "Gamer", "style": "success", "emoji": "🎮", "role_id": "100"},
            {"label": "Artist", "style": "secondary", "role_id": "200"}
        ]}
    }}]}]})
}

#[tokio::test]
async fn first_ready_sends_once_and_records_the_id() {
    let bot = start_bot(hello(), json!({})).await;

    assert!(bot.registry.on_ready().await);

    assert_eq!(bot.platform.write_count(), 1);
    let saved = bot.store.read_document(EMBED_MESSAGE).await;
    let id = saved["channels"][0]["groups"][0]["message"]["id"]
        .as_str()
        .unwrap()
        .parse::<u64>()
        .unwrap();
    assert_eq!(
        bot.platform.message(id).unwrap().message.content.as_deref(),
        Some("hi")
    );
    assert_eq!(saved["channels"][0]["name"], "welcome");
}

#[tokio::test]
async fn identical_config_twice_writes_nothing_the_second_time() {
    let bot = start_bot(hello(), json!({})).await;
    bot.registry.on_ready().await;
    bot.platform.clear_writes();

    let summary = bot.features[0].reconcile().await.unwrap();

    assert_eq!(summary.writes(), 0);
    assert_eq!(bot.platform.write_count(), 0);
}

#[tokio::test]
async fn reconnect_does_not_publish_again() {
    let bot = start_bot(hello(), panel()).await;
    bot.registry.on_ready().await;
    let after_first = bot.platform.write_count();

    assert!(!bot.registry.on_ready().await);

    assert_eq!(bot.platform.write_count(), after_first);
    assert_eq!(bot.platform.messages_in(1).len(), 1);
    assert_eq!(bot.platform.messages_in(2).len(), 1);
}

#[tokio::test]
async fn restart_keeps_message_identity() {
    let bot = start_bot(hello(), json!({})).await;
    bot.registry.on_ready().await;
    let first_id = bot.features[0].snapshot().channels[0].groups[0]
        .message
        .message_id()
        .unwrap();

    // A second process over the same files and server
    let reconciler = Reconciler::new(
        EMBED_MESSAGE,
        GUILD,
        bot.platform.clone(),
        Arc::new(ComponentRegistry::new()),
    );
    let restarted = ManagedMessages::spawn(
        EMBED_MESSAGE,
        bot.store.clone(),
        reconciler,
        Duration::from_secs(3600),
    );
    restarted.load().await.unwrap();
    bot.platform.clear_writes();
    restarted.on_ready().await.unwrap();

    assert_eq!(bot.platform.write_count(), 0);
    assert_eq!(
        restarted.snapshot().channels[0].groups[0].message.message_id(),
        Some(first_id)
    );
}

#[tokio::test]
async fn role_button_click_grants_and_updates_the_count() {
    let bot = start_bot(json!({}), panel()).await;
    bot.registry.on_ready().await;
    let message_id = bot.features[1].snapshot().channels[0].groups[0]
        .message
        .message_id()
        .unwrap();
    let labels = |platform: &MemoryPlatform| -> Vec<String> {
        platform
            .message(message_id)
            .unwrap()
            .message
            .buttons
            .iter()
            .map(|b| b.label.clone())
            .collect()
    };
    assert_eq!(labels(&bot.platform), vec!["Gamer (0)", "Artist (0)"]);

    let handler = RoleButtonHandler::new(bot.platform.clone(), bot.components.clone());
    let outcome = handler
        .handle_click(&ButtonClick {
            guild_id: GUILD,
            channel_id: 2,
            message_id,
            user_id: 77,
            custom_id: "role_button:200".to_string(),
        })
        .await
        .unwrap();

    assert_eq!(
        outcome,
        GrantOutcome::Granted {
            role_id: 200,
            member_count: Some(1)
        }
    );
    assert_eq!(labels(&bot.platform), vec!["Gamer (0)", "Artist (1)"]);
    assert!(bot.platform.writes().contains(&WriteOp::AddRole {
        guild_id: GUILD,
        user_id: 77,
        role_id: 200
    }));
}

#[tokio::test]
async fn dashboard_save_is_applied_on_next_poll() {
    let bot = start_bot(hello(), json!({})).await;
    bot.registry.on_ready().await;
    bot.platform.clear_writes();

    let platform: Arc<dyn ChatPlatform> = bot.platform.clone();
    let router = create_router(DashboardState::new(bot.store.clone(), Some(platform)));

    let mut edited = bot.store.read_document(EMBED_MESSAGE).await;
    edited["channels"][0]["groups"][0]["message"]["content"] = json!("welcome aboard");
    edited["channels"].as_array_mut().unwrap().push(json!(
        {"id": "2", "groups": [{"message": {"content": "second channel"}}]}
    ));
    let response = router
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/post/?config=embed_message")
                .header("content-type", "application/json")
                .body(Body::from(edited.to_string()))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CREATED);

    match bot.features[0].poll().await.unwrap() {
        PollOutcome::Applied(summary) => {
            assert_eq!(summary.edited, 1);
            assert_eq!(summary.created, 1);
        }
        other => panic!("unexpected outcome {:?}", other),
    }
    assert_eq!(bot.platform.messages_in(1).len(), 1);
    assert_eq!(bot.platform.messages_in(2).len(), 1);
}
