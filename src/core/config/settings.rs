use super::parsing::{
    env_optional, env_or_default, parse_bool, parse_cors_origins, parse_environment, parse_f64,
    parse_u16, parse_u32, parse_u64, parse_usize,
};
use super::secret::load_or_create_secret_key;
use super::types::{
    AiSettings, ApiSettings, ConfigError, CorsSettings, DatabaseSettings, ExamSettings,
    GradingSettings, RedisSettings, RuntimeSettings, SecuritySettings, ServerHost, ServerPort,
    ServerSettings, Settings, TelemetrySettings,
};

impl Settings {
    pub(crate) fn load() -> Result<Self, ConfigError> {
        let host = env_or_default("APP_HOST", "0.0.0.0");
        let port = env_or_default("APP_PORT", "8000");

        let environment =
            parse_environment(env_optional("APP_ENV").or_else(|| env_optional("ENVIRONMENT")));
        let strict_config =
            env_optional("APP_STRICT_CONFIG").map(|value| parse_bool(&value)).unwrap_or(false)
                || environment.is_production();

        let project_name = env_or_default("PROJECT_NAME", "Essay Exams API");
        let version = env_or_default("VERSION", env!("CARGO_PKG_VERSION"));
        let api_v1_str = env_or_default("API_V1_STR", "/api/v1");

        let secret_key = match env_optional("SECRET_KEY") {
            Some(value) => value,
            None => load_or_create_secret_key(),
        };
        let access_token_expire_minutes = parse_u64(
            "ACCESS_TOKEN_EXPIRE_MINUTES",
            env_or_default("ACCESS_TOKEN_EXPIRE_MINUTES", "10080"),
        )?;
        let algorithm = env_or_default("ALGORITHM", "HS256");

        let cors_origins = parse_cors_origins(env_optional("BACKEND_CORS_ORIGINS"))?;

        let postgres_server = env_or_default("POSTGRES_SERVER", "localhost");
        let postgres_port = parse_u16("POSTGRES_PORT", env_or_default("POSTGRES_PORT", "5432"))?;
        let postgres_user = env_or_default("POSTGRES_USER", "essays");
        let postgres_password = env_or_default("POSTGRES_PASSWORD", "");
        let postgres_db = env_or_default("POSTGRES_DB", "essay_exams");
        let database_url = env_optional("DATABASE_URL");

        let redis_host = env_or_default("REDIS_HOST", "localhost");
        let redis_port = parse_u16("REDIS_PORT", env_or_default("REDIS_PORT", "6379"))?;
        let redis_db = parse_u16("REDIS_DB", env_or_default("REDIS_DB", "0"))?;
        let redis_password = env_or_default("REDIS_PASSWORD", "");

        let openai_api_key = env_or_default("OPENAI_API_KEY", "");
        let openai_base_url = env_or_default("OPENAI_BASE_URL", "");
        let ai_model = env_or_default("AI_MODEL", "gpt-4o-mini");
        let ai_max_tokens = parse_u32("AI_MAX_TOKENS", env_or_default("AI_MAX_TOKENS", "4000"))?;
        let ai_temperature = parse_f64("AI_TEMPERATURE", env_or_default("AI_TEMPERATURE", "0.2"))?;
        let ai_request_timeout =
            parse_u64("AI_REQUEST_TIMEOUT", env_or_default("AI_REQUEST_TIMEOUT", "90"))?;
        let ai_max_retries = parse_u32("AI_MAX_RETRIES", env_or_default("AI_MAX_RETRIES", "2"))?;

        let grading_timeout_seconds = parse_u64(
            "GRADING_TIMEOUT_SECONDS",
            env_or_default("GRADING_TIMEOUT_SECONDS", "120"),
        )?;
        let grading_concurrency =
            parse_usize("GRADING_CONCURRENCY", env_or_default("GRADING_CONCURRENCY", "3"))?;
        let default_max_score =
            parse_f64("DEFAULT_MAX_SCORE", env_or_default("DEFAULT_MAX_SCORE", "10"))?;

        let expiry_sweep_interval_seconds = parse_u64(
            "EXPIRY_SWEEP_INTERVAL_SECONDS",
            env_or_default("EXPIRY_SWEEP_INTERVAL_SECONDS", "30"),
        )?;
        let answer_cache_ttl_seconds = parse_u64(
            "ANSWER_CACHE_TTL_SECONDS",
            env_or_default("ANSWER_CACHE_TTL_SECONDS", "604800"),
        )?;
        let proctoring_write_retries = parse_u32(
            "PROCTORING_WRITE_RETRIES",
            env_or_default("PROCTORING_WRITE_RETRIES", "2"),
        )?;
        let finish_lease_seconds = parse_u64(
            "FINISH_LEASE_SECONDS",
            env_or_default("FINISH_LEASE_SECONDS", "900"),
        )?;

        let log_level = env_or_default("APP_LOG_LEVEL", "info");
        let json = env_optional("APP_LOG_JSON").map(|value| parse_bool(&value)).unwrap_or(false);
        let prometheus_enabled =
            env_optional("PROMETHEUS_ENABLED").map(|value| parse_bool(&value)).unwrap_or(false);

        let settings = Self {
            server: ServerSettings {
                host: ServerHost::parse(host)?,
                port: ServerPort::parse(port)?,
            },
            runtime: RuntimeSettings { environment, strict_config },
            api: ApiSettings { project_name, version, api_v1_str },
            security: SecuritySettings { secret_key, access_token_expire_minutes, algorithm },
            cors: CorsSettings { origins: cors_origins },
            database: DatabaseSettings {
                postgres_server,
                postgres_port,
                postgres_user,
                postgres_password,
                postgres_db,
                database_url,
            },
            redis: RedisSettings {
                host: redis_host,
                port: redis_port,
                db: redis_db,
                password: redis_password,
            },
            ai: AiSettings {
                openai_api_key,
                openai_base_url,
                ai_model,
                ai_max_tokens,
                ai_temperature,
                ai_request_timeout,
                ai_max_retries,
            },
            grading: GradingSettings {
                timeout_seconds: grading_timeout_seconds,
                concurrency: grading_concurrency,
                default_max_score,
            },
            exam: ExamSettings {
                expiry_sweep_interval_seconds,
                answer_cache_ttl_seconds,
                proctoring_write_retries,
                finish_lease_seconds,
            },
            telemetry: TelemetrySettings { log_level, json, prometheus_enabled },
        };

        settings.validate()?;
        Ok(settings)
    }

    pub(crate) fn server_addr(&self) -> String {
        format!("{}:{}", self.server.host.0, self.server.port.0)
    }

    pub(crate) fn server_host(&self) -> &str {
        &self.server.host.0
    }

    pub(crate) fn server_port(&self) -> u16 {
        self.server.port.0
    }

    pub(crate) fn api(&self) -> &ApiSettings {
        &self.api
    }

    pub(crate) fn security(&self) -> &SecuritySettings {
        &self.security
    }

    pub(crate) fn cors(&self) -> &CorsSettings {
        &self.cors
    }

    pub(crate) fn database(&self) -> &DatabaseSettings {
        &self.database
    }

    pub(crate) fn redis(&self) -> &RedisSettings {
        &self.redis
    }

    pub(crate) fn ai(&self) -> &AiSettings {
        &self.ai
    }

    pub(crate) fn grading(&self) -> &GradingSettings {
        &self.grading
    }

    pub(crate) fn exam(&self) -> &ExamSettings {
        &self.exam
    }

    pub(crate) fn telemetry(&self) -> &TelemetrySettings {
        &self.telemetry
    }

    pub(crate) fn runtime(&self) -> &RuntimeSettings {
        &self.runtime
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.grading.concurrency == 0 {
            return Err(ConfigError::InvalidValue {
                field: "GRADING_CONCURRENCY",
                value: "0".to_string(),
            });
        }

        if self.grading.timeout_seconds == 0 {
            return Err(ConfigError::InvalidValue {
                field: "GRADING_TIMEOUT_SECONDS",
                value: "0".to_string(),
            });
        }

        if self.grading.default_max_score <= 0.0 {
            return Err(ConfigError::InvalidValue {
                field: "DEFAULT_MAX_SCORE",
                value: self.grading.default_max_score.to_string(),
            });
        }

        if self.exam.expiry_sweep_interval_seconds == 0 {
            return Err(ConfigError::InvalidValue {
                field: "EXPIRY_SWEEP_INTERVAL_SECONDS",
                value: "0".to_string(),
            });
        }

        if self.exam.finish_lease_seconds == 0 {
            return Err(ConfigError::InvalidValue {
                field: "FINISH_LEASE_SECONDS",
                value: "0".to_string(),
            });
        }

        if !(self.runtime.strict_config || self.runtime.environment.is_production()) {
            return Ok(());
        }

        if self.database.database_url.is_none() && self.database.postgres_password.is_empty() {
            return Err(ConfigError::MissingSecret("POSTGRES_PASSWORD"));
        }
        if self.ai.openai_api_key.is_empty() {
            return Err(ConfigError::MissingSecret("OPENAI_API_KEY"));
        }
        if self.ai.openai_base_url.is_empty() {
            return Err(ConfigError::MissingSecret("OPENAI_BASE_URL"));
        }

        Ok(())
    }
}
