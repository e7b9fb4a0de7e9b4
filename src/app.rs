pub const APP_NAME: &str = env!("APP_NAME");
pub const APP_VERSION: &str = env!("APP_VERSION");
pub const APP_ID: &str = env!("APP_ID");

/// Environment variable naming an explicit configuration file
pub const CONFIG_ENV_VAR: &str = "CONTROLPANEL_CONFIG";
pub const CONFIG_FILE_NAME: &str = "config.json";
