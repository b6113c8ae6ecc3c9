use super::config::{default_config_path, default_store_path, CourierConfig};
use std::path::PathBuf;

/// Write a configuration file
///
/// Without `from`, writes the commented default. With `from`, migrates an
/// existing (typically legacy JSON) config to TOML; `store_path` then
/// overrides the migrated store directory. Refuses to overwrite an existing
/// file unless `force` is set.
pub fn execute(
    config_path: Option<String>,
    store_path: Option<String>,
    from: Option<String>,
    force: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    let config_path = config_path
        .map(PathBuf::from)
        .unwrap_or_else(default_config_path);

    if config_path.exists() && !force {
        return Err(format!(
            "Config file '{}' already exists (use --force to overwrite)",
            config_path.display()
        )
        .into());
    }

    let store_path = match from {
        Some(from) => {
            let mut config = CourierConfig::load(&PathBuf::from(&from))?;
            if let Some(store_path) = store_path {
                config.bot.store_path = PathBuf::from(store_path);
            }
            config.save(&config_path)?;
            println!("📝 Migrated {} to {}", from, config_path.display());
            config.bot.store_path
        }
        None => {
            let store_path = store_path
                .map(PathBuf::from)
                .unwrap_or_else(default_store_path);
            CourierConfig::create_default(&config_path, &store_path)?;
            println!("📝 Created {}", config_path.display());
            store_path
        }
    };

    println!("   Store: {}", store_path.display());
    println!();
    println!("Edit [bot] with your account before logging in.");

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_init_writes_loadable_config() {
        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("config.toml");
        let store_path = temp_dir.path().join("store");

        execute(
            Some(config_path.display().to_string()),
            Some(store_path.display().to_string()),
            None,
            false,
        )
        .unwrap();

        let config = CourierConfig::load(&config_path).unwrap();
        assert_eq!(config.bot.store_path, store_path);
    }

    #[test]
    fn test_init_refuses_overwrite_without_force() {
        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("config.toml");
        std::fs::write(&config_path, "keep me").unwrap();

        let path = Some(config_path.display().to_string());
        assert!(execute(path.clone(), None, None, false).is_err());
        assert_eq!(std::fs::read_to_string(&config_path).unwrap(), "keep me");

        execute(path, None, None, true).unwrap();
        assert!(CourierConfig::load(&config_path).is_ok());
    }

    #[test]
    fn test_init_migrates_legacy_json() {
        let temp_dir = TempDir::new().unwrap();
        let legacy_path = temp_dir.path().join("config.json");
        let config_path = temp_dir.path().join("config.toml");
        std::fs::write(
            &legacy_path,
            r#"{
                "bot": {
                    "user_id": "@bot:example.org",
                    "home_server": "https://example.org",
                    "access_token": "",
                    "rooms": {"science_news_room": "!sci:example.org"}
                },
                "news": {
                    "ars": {"url": "https://example.org/feed", "room": "science_news_room"}
                }
            }"#,
        )
        .unwrap();

        execute(
            Some(config_path.display().to_string()),
            Some("/srv/courier/store".to_string()),
            Some(legacy_path.display().to_string()),
            false,
        )
        .unwrap();

        let migrated = CourierConfig::load(&config_path).unwrap();
        let legacy = CourierConfig::load(&legacy_path).unwrap();
        assert_eq!(migrated.bot.store_path, PathBuf::from("/srv/courier/store"));
        assert_eq!(migrated.rooms, legacy.rooms);
        assert_eq!(migrated.news, legacy.news);
        assert_eq!(migrated.room_id("science_news_room"), Some("!sci:example.org"));
        assert!(migrated.bot.access_token.is_none());
    }
}
