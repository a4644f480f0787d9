//! 配置文件读写测试
//!
//! 覆盖 AppConfig 的落盘、读取与校验失败路径

#[cfg(test)]
mod tests {
    use super::super::config::{AppConfig, ConcurrentLimit};
    use std::path::PathBuf;
    use tempfile::tempdir;

    /// 创建测试用的配置
    fn create_test_config() -> AppConfig {
        let mut config = AppConfig::default();
        config.download.concurrent_limit = ConcurrentLimit {
            item: 3,
            sub_item: 6,
        };
        config.download.max_retries = 5;
        config.download.download_base = PathBuf::from("/test/downloads");
        config.download.create_item_folder = false;
        config.logging.level = "debug".to_string();
        config
    }

    #[test]
    fn test_save_and_load_roundtrip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested").join("config.json");

        let config = create_test_config();
        config.save_to(&path).unwrap();
        assert!(path.exists());

        let loaded = AppConfig::load_from(&path).unwrap();
        assert_eq!(loaded, config);
    }

    #[test]
    fn test_load_rejects_invalid_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.json");

        let mut config = create_test_config();
        config.download.max_retries = 99;
        config.save_to(&path).unwrap();

        assert!(AppConfig::load_from(&path).is_err());
    }

    #[test]
    fn test_load_rejects_malformed_json() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, "{ not json").unwrap();

        let err = AppConfig::load_from(&path).unwrap_err();
        assert!(format!("{:#}", err).contains("Failed to parse config file"));
    }

    #[test]
    fn test_load_missing_file_fails() {
        let dir = tempdir().unwrap();
        assert!(AppConfig::load_from(&dir.path().join("absent.json")).is_err());
    }

    #[test]
    fn test_import_rejects_invalid_log_level() {
        let mut config = create_test_config();
        config.logging.level = "loud".to_string();
        let json = serde_json::to_string(&config).unwrap();

        assert!(AppConfig::import(&json).is_err());
    }
}
