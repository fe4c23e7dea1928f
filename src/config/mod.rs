pub mod error;
pub mod load;
pub mod paths;
pub mod save;
pub mod settings;

pub use error::ConfigError;
pub use load::{load_global_settings, load_settings};
pub use paths::{
    default_global_config_path, default_state_root_path, state_root_override,
    GLOBAL_SETTINGS_FILE_NAME, GLOBAL_STATE_DIR, STATE_ROOT_ENV,
};
pub use save::save_settings;
pub use settings::{Settings, StoreKind};

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::path::{Path, PathBuf};
    use std::sync::Mutex;
    use tempfile::tempdir;

    static ENV_LOCK: Mutex<()> = Mutex::new(());

    struct EnvGuard {
        key: &'static str,
        old: Option<std::ffi::OsString>,
    }

    impl EnvGuard {
        fn set(key: &'static str, value: &Path) -> Self {
            let old = std::env::var_os(key);
            std::env::set_var(key, value);
            Self { key, old }
        }

        fn unset(key: &'static str) -> Self {
            let old = std::env::var_os(key);
            std::env::remove_var(key);
            Self { key, old }
        }
    }

    impl Drop for EnvGuard {
        fn drop(&mut self) {
            if let Some(old) = self.old.take() {
                std::env::set_var(self.key, old);
            } else {
                std::env::remove_var(self.key);
            }
        }
    }

    #[test]
    fn global_config_path_uses_home_tasking_config_yaml() {
        let _guard = ENV_LOCK.lock().unwrap_or_else(|err| err.into_inner());
        let dir = tempdir().expect("temp dir");
        let _home = EnvGuard::set("HOME", dir.path());

        assert_eq!(
            default_global_config_path().expect("config path"),
            dir.path().join(".tasking/config.yaml")
        );
        let settings = load_global_settings().expect("missing file falls back");
        assert_eq!(settings, Settings::default());
    }

    #[test]
    fn state_root_prefers_env_override_then_settings() {
        let _guard = ENV_LOCK.lock().unwrap_or_else(|err| err.into_inner());
        let dir = tempdir().expect("temp dir");
        let _home = EnvGuard::set("HOME", dir.path());
        let _unset = EnvGuard::unset(STATE_ROOT_ENV);

        let mut settings = Settings::default();
        assert_eq!(
            settings.resolve_state_root().expect("default root"),
            dir.path().join(".tasking")
        );
        settings.state_root = Some(PathBuf::from("/srv/tasking"));
        assert_eq!(
            settings.resolve_state_root().expect("configured root"),
            PathBuf::from("/srv/tasking")
        );

        let override_root = dir.path().join("override");
        let _env = EnvGuard::set(STATE_ROOT_ENV, &override_root);
        assert_eq!(
            settings.resolve_state_root().expect("env root"),
            override_root
        );
    }

    #[test]
    fn saved_settings_load_back_and_invalid_files_fail() {
        let dir = tempdir().expect("temp dir");
        let path = dir.path().join("nested/config.yaml");
        let settings = Settings {
            store: StoreKind::Sqlite,
            max_concurrency: 8,
            agent_reply_timeout_secs: Some(120),
            ..Settings::default()
        };
        save_settings(&settings, &path).expect("save settings");
        save_settings(&settings, &path).expect("save settings again");
        assert_eq!(load_settings(&path).expect("load settings"), settings);
        let leftovers = fs::read_dir(dir.path().join("nested"))
            .expect("list config dir")
            .count();
        assert_eq!(leftovers, 1);

        fs::write(&path, "max_concurrency: [not, a, number]").expect("write broken yaml");
        assert!(matches!(
            load_settings(&path),
            Err(ConfigError::Parse { .. })
        ));
        fs::write(&path, "max_concurrency: 0").expect("write invalid yaml");
        assert!(matches!(
            load_settings(&path),
            Err(ConfigError::Invalid(_))
        ));
    }
}
