//! Config load/save round trips in isolated temp directories.

use tempfile::TempDir;
use xyrelay::config::{AccountConfig, Config, GoodsConfig};
use xyrelay::store::{AutoDeliveryConfig, AutoReplyRule, MatchType};

// ─────────────────────────────────────────────────────────────────────────────
// First run
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn missing_config_is_created_with_defaults() {
    let dir = TempDir::new().unwrap();
    let config = Config::load_from_dir(dir.path()).await.unwrap();

    assert!(dir.path().join("config.toml").exists());
    assert_eq!(config.config_path, dir.path().join("config.toml"));
    assert_eq!(config.transport.ws_url, "wss://wss-goofish.dingtalk.com/");
    assert_eq!(config.scheduler.workers, 10);
    assert_eq!(config.scheduler.admission, 100);
    assert_eq!(config.token.validity_hours, 20);
    assert_eq!(config.reliability.stable_session_secs, 60);
    assert_eq!(config.reliability.min_reconnect_ms, 1_000);
    assert!(config.accounts.is_empty());
    assert_eq!(config.db_path(), dir.path().join("xyrelay.db"));
}

#[cfg(unix)]
#[tokio::test]
async fn created_config_is_owner_only() {
    use std::os::unix::fs::PermissionsExt;

    let dir = TempDir::new().unwrap();
    Config::load_from_dir(dir.path()).await.unwrap();
    let mode = std::fs::metadata(dir.path().join("config.toml"))
        .unwrap()
        .permissions()
        .mode();
    assert_eq!(mode & 0o077, 0, "config holds cookies; mode was {mode:o}");
}

// ─────────────────────────────────────────────────────────────────────────────
// Round trip
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn accounts_and_rules_survive_save_and_reload() {
    let dir = TempDir::new().unwrap();
    let mut config = Config::load_from_dir(dir.path()).await.unwrap();
    config.accounts.push(AccountConfig {
        id: "shop-a".into(),
        cookie: "unb=1001; _m_h5_tk=abc_1".into(),
        device_id: Some("DEV-1001".into()),
        enabled: true,
        goods: vec![GoodsConfig {
            goods_id: "7712".into(),
            delivery: AutoDeliveryConfig {
                enabled: true,
                content: "感谢购买，马上安排发货".into(),
                auto_confirm_shipment: true,
            },
            replies: vec![AutoReplyRule {
                keyword: "^\\d+元$".into(),
                match_type: MatchType::Regex,
                reply: "还价收到".into(),
            }],
        }],
    });
    config.scheduler.workers = 4;
    config.save().await.unwrap();

    let reloaded = Config::load_from_dir(dir.path()).await.unwrap();
    assert_eq!(reloaded.scheduler.workers, 4);
    let account = reloaded.account("shop-a").unwrap();
    assert_eq!(account.device_id.as_deref(), Some("DEV-1001"));
    let goods = &account.goods[0];
    assert!(goods.delivery.auto_confirm_shipment);
    assert_eq!(goods.delivery.content, "感谢购买，马上安排发货");
    assert_eq!(goods.replies[0].match_type, MatchType::Regex);
}

#[tokio::test]
async fn save_leaves_no_temp_files_behind() {
    let dir = TempDir::new().unwrap();
    let config = Config::load_from_dir(dir.path()).await.unwrap();
    config.save().await.unwrap();
    config.save().await.unwrap();

    let leftovers: Vec<_> = std::fs::read_dir(dir.path())
        .unwrap()
        .filter_map(Result::ok)
        .filter(|e| e.file_name().to_string_lossy().contains(".tmp-"))
        .collect();
    assert!(leftovers.is_empty());
}

// ─────────────────────────────────────────────────────────────────────────────
// Parsing and validation
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn partial_file_takes_defaults_for_missing_sections() {
    let dir = TempDir::new().unwrap();
    std::fs::write(
        dir.path().join("config.toml"),
        r#"
[scheduler]
workers = 2
admission = 8

[[accounts]]
id = "shop-a"
cookie = "unb=1001"

[[accounts.goods]]
goods_id = "*"
replies = [{ keyword = "多少钱", reply = "9.9元包邮" }]
"#,
    )
    .unwrap();

    let config = Config::load_from_dir(dir.path()).await.unwrap();
    assert_eq!(config.scheduler.workers, 2);
    assert_eq!(config.transport.heartbeat_interval_secs, 15);
    let account = &config.accounts[0];
    assert!(account.enabled);
    assert_eq!(account.goods[0].replies[0].match_type, MatchType::Contains);
    assert!(!account.goods[0].delivery.enabled);
}

#[tokio::test]
async fn invalid_regex_rule_fails_to_load() {
    let dir = TempDir::new().unwrap();
    std::fs::write(
        dir.path().join("config.toml"),
        r#"
[[accounts]]
id = "shop-a"

[[accounts.goods]]
goods_id = "7712"
replies = [{ keyword = "([", match_type = "regex", reply = "x" }]
"#,
    )
    .unwrap();

    let err = Config::load_from_dir(dir.path()).await.unwrap_err();
    assert!(format!("{err:#}").contains("not a valid regex"));
}

#[test]
fn duplicate_account_ids_are_rejected() {
    let mut config = Config::default();
    for _ in 0..2 {
        config.accounts.push(AccountConfig {
            id: "shop-a".into(),
            cookie: String::new(),
            device_id: None,
            enabled: true,
            goods: Vec::new(),
        });
    }
    assert!(config.validate().is_err());
}

#[test]
fn admission_below_workers_is_rejected() {
    let mut config = Config::default();
    config.scheduler.workers = 10;
    config.scheduler.admission = 5;
    let err = config.validate().unwrap_err();
    assert!(err.to_string().contains("scheduler.admission"));
}

#[test]
fn wrong_type_fails_to_parse() {
    let result: Result<Config, _> = toml::from_str("[scheduler]\nworkers = \"many\"\n");
    assert!(result.is_err());
}
