use std::collections::{HashMap, HashSet};
use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::error::{EngineError, EngineResult};

/// Engine configuration. An explicit value passed into constructors; there
/// is no global instance. Tests build a fresh one per test.
#[derive(Debug, Clone, Default)]
pub struct Config {
    pub database: DatabaseConfig,
    pub memory: MemoryConfig,
    pub file_read: FileReadConfig,
    pub command_runner: CommandRunnerConfig,
    pub audio: AudioConfig,
    pub executor: ExecutorConfig,
    pub llm: HashMap<String, LlmProviderConfig>,
}

#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub url: String,
    pub user: Option<String>,
    pub password: Option<String>,
    pub max_connections: u32,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: "sqlite://maestro.db".to_owned(),
            user: None,
            password: None,
            max_connections: 10,
        }
    }
}

#[derive(Debug, Clone)]
pub struct MemoryConfig {
    /// Default window for `MemoryStore::load_memory`.
    pub max_entries: u32,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self { max_entries: 50 }
    }
}

#[derive(Debug, Clone)]
pub struct FileReadConfig {
    pub base_dir: PathBuf,
    pub allow_symlinks: bool,
    pub max_size_bytes: u64,
    pub max_path_length: usize,
}

impl Default for FileReadConfig {
    fn default() -> Self {
        Self {
            base_dir: PathBuf::from("."),
            allow_symlinks: false,
            max_size_bytes: 10 * 1024 * 1024,
            max_path_length: 512,
        }
    }
}

#[derive(Debug, Clone)]
pub struct CommandRunnerConfig {
    pub timeout: Duration,
    /// Empty set = allow everything that is not on the built-in blocklist.
    pub allowed_commands: HashSet<String>,
}

impl Default for CommandRunnerConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(60),
            allowed_commands: HashSet::new(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct AudioConfig {
    pub output_dir: PathBuf,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            output_dir: PathBuf::from("./audio"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    /// Bound on concurrently running tasks within a batch.
    pub max_parallelism: usize,
    /// Wall-clock limit per task. A batch gets `task_timeout * batch_len`.
    pub task_timeout: Duration,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            max_parallelism: num_cpus::get(),
            task_timeout: Duration::from_secs(300),
        }
    }
}

#[derive(Debug, Clone)]
pub struct LlmProviderConfig {
    pub api_key: String,
    pub model: String,
    pub base_url: Option<String>,
    pub timeout: Duration,
    pub max_retries: u32,
}

impl Default for LlmProviderConfig {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            model: String::new(),
            base_url: None,
            timeout: Duration::from_secs(120),
            max_retries: 3,
        }
    }
}

impl Config {
    /// Load configuration from the environment (and a `.env` file if one is
    /// present). Unset variables fall back to the defaults above.
    pub fn from_env() -> EngineResult<Self> {
        dotenv::dotenv().ok();

        let database = DatabaseConfig {
            url: env_or("MAESTRO_DATABASE_URL", DatabaseConfig::default().url),
            user: env::var("MAESTRO_DATABASE_USER").ok(),
            password: env::var("MAESTRO_DATABASE_PASSWORD").ok(),
            max_connections: env_parse("MAESTRO_DATABASE_MAX_CONNECTIONS", 10)?,
        };

        let memory = MemoryConfig {
            max_entries: env_parse("MAESTRO_MEMORY_MAX_ENTRIES", 50)?,
        };

        let file_read = FileReadConfig {
            base_dir: PathBuf::from(env_or("MAESTRO_FILE_READ_BASE_DIR", ".".to_owned())),
            allow_symlinks: env_parse("MAESTRO_FILE_READ_ALLOW_SYMLINKS", false)?,
            max_size_bytes: env_parse("MAESTRO_FILE_READ_MAX_SIZE_BYTES", 10 * 1024 * 1024)?,
            max_path_length: env_parse("MAESTRO_FILE_READ_MAX_PATH_LENGTH", 512)?,
        };

        let command_runner = CommandRunnerConfig {
            timeout: Duration::from_secs(env_parse("MAESTRO_COMMAND_TIMEOUT_SECS", 60u64)?),
            allowed_commands: env::var("MAESTRO_ALLOWED_COMMANDS")
                .map(|raw| {
                    raw.split(',')
                        .map(str::trim)
                        .filter(|s| !s.is_empty())
                        .map(str::to_owned)
                        .collect()
                })
                .unwrap_or_default(),
        };

        let audio = AudioConfig {
            output_dir: PathBuf::from(env_or("MAESTRO_AUDIO_OUTPUT_DIR", "./audio".to_owned())),
        };

        let executor = ExecutorConfig {
            max_parallelism: env_parse("MAESTRO_MAX_PARALLELISM", num_cpus::get())?,
            task_timeout: Duration::from_secs(env_parse("MAESTRO_TASK_TIMEOUT_SECS", 300u64)?),
        };

        let mut llm = HashMap::new();
        for provider in ["openai", "anthropic"] {
            let prefix = provider.to_uppercase();
            let Ok(api_key) = env::var(format!("{prefix}_API_KEY")) else {
                continue;
            };
            llm.insert(
                provider.to_owned(),
                LlmProviderConfig {
                    api_key,
                    model: env_or(&format!("MAESTRO_{prefix}_MODEL"), String::new()),
                    base_url: env::var(format!("MAESTRO_{prefix}_BASE_URL")).ok(),
                    timeout: Duration::from_secs(env_parse(
                        &format!("MAESTRO_{prefix}_TIMEOUT_SECS"),
                        120u64,
                    )?),
                    max_retries: env_parse(&format!("MAESTRO_{prefix}_MAX_RETRIES"), 3)?,
                },
            );
        }

        Ok(Self {
            database,
            memory,
            file_read,
            command_runner,
            audio,
            executor,
            llm,
        })
    }
}

fn env_or(key: &str, default: String) -> String {
    env::var(key).unwrap_or(default)
}

fn env_parse<T: FromStr>(key: &str, default: T) -> EngineResult<T> {
    match env::var(key) {
        Ok(raw) => raw.parse::<T>().map_err(|_| {
            EngineError::configuration(format!("cannot parse environment variable {key}={raw}"))
        }),
        Err(_) => Ok(default),
    }
}
