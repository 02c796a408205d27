use std::path::PathBuf;

use super::parsing::{
    env_optional, env_or_default, parse_bool, parse_environment, parse_f64, parse_fraction,
    parse_u16, parse_u32, parse_u64, parse_usize,
};
use super::types::{
    AiSettings, ConfigError, DatabaseSettings, GradingSettings, RuntimeSettings, S3Settings,
    Settings, StorageSettings, TelemetrySettings,
};

impl Settings {
    pub(crate) fn load() -> Result<Self, ConfigError> {
        let environment =
            parse_environment(env_optional("GRADER_ENV").or_else(|| env_optional("ENVIRONMENT")));
        let strict_config =
            env_optional("GRADER_STRICT_CONFIG").map(|value| parse_bool(&value)).unwrap_or(false)
                || environment.is_production();

        let postgres_server = env_or_default("POSTGRES_SERVER", "localhost");
        let postgres_port = parse_u16("POSTGRES_PORT", env_or_default("POSTGRES_PORT", "5432"))?;
        let postgres_user = env_or_default("POSTGRES_USER", "grader");
        let postgres_password = env_or_default("POSTGRES_PASSWORD", "");
        let postgres_db = env_or_default("POSTGRES_DB", "grader_db");
        let database_url = env_optional("DATABASE_URL");
        let max_connections = parse_u32(
            "DATABASE_MAX_CONNECTIONS",
            env_or_default("DATABASE_MAX_CONNECTIONS", "10"),
        )?;

        let openai_api_key = env_or_default("OPENAI_API_KEY", "");
        let openai_base_url = env_or_default("OPENAI_BASE_URL", "https://api.openai.com/v1");
        let ai_model = env_or_default("AI_MODEL", "gpt-4o-mini");
        let ai_temperature =
            parse_f64("AI_TEMPERATURE", env_or_default("AI_TEMPERATURE", "0.3"))?;
        let ai_request_timeout =
            parse_u64("AI_REQUEST_TIMEOUT", env_or_default("AI_REQUEST_TIMEOUT", "120"))?;
        let ai_max_retries = parse_u32("AI_MAX_RETRIES", env_or_default("AI_MAX_RETRIES", "2"))?;

        let s3_endpoint = env_or_default("S3_ENDPOINT", "https://storage.yandexcloud.net");
        let s3_access_key = env_or_default("S3_ACCESS_KEY", "");
        let s3_secret_key = env_or_default("S3_SECRET_KEY", "");
        let s3_bucket = env_or_default("S3_BUCKET", "grader-documents");
        let s3_region = env_or_default("S3_REGION", "ru-central1");

        let storage_root = PathBuf::from(env_or_default("STORAGE_ROOT", "storage"));
        let temp_dir = env_optional("GRADER_TEMP_DIR").map(PathBuf::from).unwrap_or_else(|| {
            std::env::temp_dir().join("assignment-grader")
        });

        let basic_fraction = parse_fraction(
            "GRADING_BASIC_FRACTION",
            env_or_default("GRADING_BASIC_FRACTION", "0.6"),
        )?;
        let reference_char_limit = parse_usize(
            "GRADING_REFERENCE_CHAR_LIMIT",
            env_or_default("GRADING_REFERENCE_CHAR_LIMIT", "8000"),
        )?;
        let synthesis_max_tokens = parse_u32(
            "GRADING_SYNTHESIS_MAX_TOKENS",
            env_or_default("GRADING_SYNTHESIS_MAX_TOKENS", "3000"),
        )?;
        let grading_max_tokens =
            parse_u32("GRADING_MAX_TOKENS", env_or_default("GRADING_MAX_TOKENS", "1500"))?;
        let grading_temperature =
            parse_f64("GRADING_TEMPERATURE", env_or_default("GRADING_TEMPERATURE", "0.2"))?;
        let poll_interval_seconds = parse_u64(
            "GRADING_POLL_INTERVAL_SECONDS",
            env_or_default("GRADING_POLL_INTERVAL_SECONDS", "30"),
        )?;
        let retry_backoff_seconds = parse_u64(
            "GRADING_RETRY_BACKOFF_SECONDS",
            env_or_default("GRADING_RETRY_BACKOFF_SECONDS", "3600"),
        )?;

        let log_level = env_or_default("GRADER_LOG_LEVEL", "info");
        let json = env_optional("GRADER_LOG_JSON").map(|value| parse_bool(&value)).unwrap_or(false);
        let prometheus_enabled =
            env_optional("PROMETHEUS_ENABLED").map(|value| parse_bool(&value)).unwrap_or(false);
        let metrics_addr = env_or_default("METRICS_ADDR", "0.0.0.0:9100");

        let settings = Self {
            runtime: RuntimeSettings { environment, strict_config },
            database: DatabaseSettings {
                postgres_server,
                postgres_port,
                postgres_user,
                postgres_password,
                postgres_db,
                database_url,
                max_connections,
            },
            ai: AiSettings {
                openai_api_key,
                openai_base_url,
                ai_model,
                ai_temperature,
                ai_request_timeout,
                ai_max_retries,
            },
            s3: S3Settings {
                endpoint: s3_endpoint,
                access_key: s3_access_key,
                secret_key: s3_secret_key,
                bucket: s3_bucket,
                region: s3_region,
            },
            storage: StorageSettings { root: storage_root, temp_dir },
            grading: GradingSettings {
                basic_fraction,
                reference_char_limit,
                synthesis_max_tokens,
                grading_max_tokens,
                grading_temperature,
                poll_interval_seconds,
                retry_backoff_seconds,
            },
            telemetry: TelemetrySettings { log_level, json, prometheus_enabled, metrics_addr },
        };

        settings.validate()?;

        Ok(settings)
    }

    pub(crate) fn database(&self) -> &DatabaseSettings {
        &self.database
    }

    pub(crate) fn ai(&self) -> &AiSettings {
        &self.ai
    }

    pub(crate) fn s3(&self) -> &S3Settings {
        &self.s3
    }

    pub(crate) fn storage(&self) -> &StorageSettings {
        &self.storage
    }

    pub(crate) fn grading(&self) -> &GradingSettings {
        &self.grading
    }

    pub(crate) fn telemetry(&self) -> &TelemetrySettings {
        &self.telemetry
    }

    pub(crate) fn runtime(&self) -> &RuntimeSettings {
        &self.runtime
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.ai.ai_request_timeout == 0 {
            return Err(ConfigError::InvalidValue {
                field: "AI_REQUEST_TIMEOUT",
                value: String::from("0"),
            });
        }

        if self.database.max_connections == 0 {
            return Err(ConfigError::InvalidValue {
                field: "DATABASE_MAX_CONNECTIONS",
                value: String::from("0"),
            });
        }

        if self.grading.reference_char_limit == 0 {
            return Err(ConfigError::InvalidValue {
                field: "GRADING_REFERENCE_CHAR_LIMIT",
                value: String::from("0"),
            });
        }

        if !(self.runtime.strict_config || self.runtime.environment.is_production()) {
            return Ok(());
        }

        if self.database.database_url.is_none() && self.database.postgres_password.is_empty() {
            return Err(ConfigError::MissingSecret("POSTGRES_PASSWORD"));
        }

        // The pipeline degrades to basic grading without a key, so this is not fatal.
        if self.ai.openai_api_key.is_empty() {
            tracing::warn!("OPENAI_API_KEY is not set; grading will use the basic policy only");
        }

        Ok(())
    }
}
