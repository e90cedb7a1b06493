//! Layered configuration loading.
//!
//! Layers, lowest precedence first: application defaults, the configuration
//! file, `CESTX_*` environment variables, command-line flags.
//!
//! The layers are assembled with `MergeComposer` by hand rather than through
//! the derived `load()` because the clap `Cli` owns subcommand dispatch and
//! the `--config` flag, and because typed environment variables must fail
//! loudly. Figment's environment provider would silently drop
//! `CESTX_BROKER_PREFETCH=lots`; this loader reports it.
//!
//! Environment lookups go through [`mockable::Env`] so tests can supply
//! variables without touching the process environment.

use camino::Utf8PathBuf;
use cap_std::ambient_authority;
use cap_std::fs_utf8::Dir;
use ortho_config::discovery::ConfigDiscovery;
use ortho_config::serde_json::{self, Map, Value};
use ortho_config::{MergeComposer, toml};

use crate::config::{AppConfig, Cli};
use crate::error::{ConfigError, Result};

/// How an environment variable's text is interpreted.
#[derive(Clone, Copy)]
enum EnvVarType {
    /// Taken verbatim.
    String,
    /// Unsigned integer; anything else is an error.
    U64,
    /// Comma-separated list of strings; blank items are dropped.
    List,
}

/// One environment variable and where its value lands in the config tree.
struct EnvVarSpec {
    env_var: &'static str,
    path: &'static [&'static str],
    var_type: EnvVarType,
}

macro_rules! env_spec {
    ($name:literal, [$($segment:literal),+], $kind:ident) => {
        EnvVarSpec {
            env_var: $name,
            path: &[$($segment),+],
            var_type: EnvVarType::$kind,
        }
    };
}

/// Every recognised `CESTX_*` variable.
const ENV_VAR_SPECS: &[EnvVarSpec] = &[
    env_spec!("CESTX_ENGINE_SOCKET", ["engine_socket"], String),
    env_spec!("CESTX_LOG_LEVEL", ["log_level"], String),
    // broker
    env_spec!("CESTX_BROKER_URL", ["broker", "url"], String),
    env_spec!("CESTX_BROKER_MACHINE_EXCHANGE", ["broker", "machine_exchange"], String),
    env_spec!("CESTX_BROKER_ROUTE_EXCHANGE", ["broker", "route_exchange"], String),
    env_spec!("CESTX_BROKER_PREFETCH", ["broker", "prefetch"], U64),
    // database
    env_spec!("CESTX_DATABASE_URL", ["database", "url"], String),
    env_spec!("CESTX_DATABASE_MAX_CONNECTIONS", ["database", "max_connections"], U64),
    // cache
    env_spec!("CESTX_CACHE_URL", ["cache", "url"], String),
    env_spec!("CESTX_CACHE_TEMPLATE_TTL_SECS", ["cache", "template_ttl_secs"], U64),
    env_spec!("CESTX_CACHE_LEDGER_TTL_SECS", ["cache", "ledger_ttl_secs"], U64),
    env_spec!("CESTX_CACHE_LOCK_TTL_SECS", ["cache", "lock_ttl_secs"], U64),
    // object store
    env_spec!("CESTX_OBJECT_STORE_ENDPOINT", ["object_store", "endpoint"], String),
    env_spec!("CESTX_OBJECT_STORE_REGION", ["object_store", "region"], String),
    env_spec!("CESTX_OBJECT_STORE_BUCKET", ["object_store", "bucket"], String),
    env_spec!("CESTX_OBJECT_STORE_ACCESS_KEY", ["object_store", "access_key"], String),
    env_spec!("CESTX_OBJECT_STORE_SECRET_KEY", ["object_store", "secret_key"], String),
    // sandbox
    env_spec!("CESTX_SANDBOX_CPU_SHARES", ["sandbox", "cpu_shares"], U64),
    env_spec!("CESTX_SANDBOX_MEMORY_LIMIT_BYTES", ["sandbox", "memory_limit_bytes"], U64),
    env_spec!("CESTX_SANDBOX_CONTAINER_PORT", ["sandbox", "container_port"], U64),
    env_spec!("CESTX_SANDBOX_HOST_PORT", ["sandbox", "host_port"], U64),
    env_spec!("CESTX_SANDBOX_IMAGE_PREFIX", ["sandbox", "image_prefix"], String),
    env_spec!("CESTX_SANDBOX_EXPIRY_SECS", ["sandbox", "expiry_secs"], U64),
    env_spec!("CESTX_SANDBOX_CREDENTIAL_LENGTH", ["sandbox", "credential_length"], U64),
    // proxy
    env_spec!("CESTX_PROXY_API_URL", ["proxy", "api_url"], String),
    env_spec!("CESTX_PROXY_PROVIDER", ["proxy", "provider"], String),
    env_spec!("CESTX_PROXY_BASE_DOMAIN", ["proxy", "base_domain"], String),
    env_spec!("CESTX_PROXY_MIDDLEWARES", ["proxy", "middlewares"], List),
    env_spec!("CESTX_PROXY_URL_SCHEME", ["proxy", "url_scheme"], String),
    env_spec!("CESTX_PROXY_REQUEST_TIMEOUT_SECS", ["proxy", "request_timeout_secs"], U64),
    // processing
    env_spec!("CESTX_PROCESSING_HANDLER_TIMEOUT_SECS", ["processing", "handler_timeout_secs"], U64),
    env_spec!("CESTX_PROCESSING_MAX_ATTEMPTS", ["processing", "max_attempts"], U64),
    env_spec!("CESTX_PROCESSING_BACKOFF_INITIAL_MS", ["processing", "backoff_initial_ms"], U64),
    env_spec!("CESTX_PROCESSING_BACKOFF_MAX_MS", ["processing", "backoff_max_ms"], U64),
    env_spec!("CESTX_PROCESSING_LOCK_WAIT_SECS", ["processing", "lock_wait_secs"], U64),
    env_spec!("CESTX_PROCESSING_ADDRESS_POLL_ATTEMPTS", ["processing", "address_poll_attempts"], U64),
    env_spec!("CESTX_PROCESSING_STOP_ROUTE_POLICY", ["processing", "stop_route_policy"], String),
];

/// Names of every environment variable the loader reads.
#[must_use]
pub fn env_var_names() -> Vec<&'static str> {
    ENV_VAR_SPECS.iter().map(|spec| spec.env_var).collect()
}

fn load_config_file(path: &Utf8PathBuf, composer: &mut MergeComposer) -> Result<()> {
    let current_dir = Utf8PathBuf::from(".");
    let parent = path
        .parent()
        .filter(|dir| !dir.as_str().is_empty())
        .unwrap_or_else(|| current_dir.as_ref());
    let file_name = path.file_name().unwrap_or(path.as_str());

    let dir = Dir::open_ambient_dir(parent, ambient_authority()).map_err(|e| {
        ConfigError::ParseError {
            message: format!("failed to open directory {parent}: {e}"),
        }
    })?;
    let content = dir
        .read_to_string(file_name)
        .map_err(|e| ConfigError::ParseError {
            message: format!("failed to read {path}: {e}"),
        })?;
    let value =
        toml::from_str::<serde_json::Value>(&content).map_err(|e| ConfigError::ParseError {
            message: format!("failed to parse {path}: {e}"),
        })?;

    composer.push_file(value, Some(path.clone()));
    Ok(())
}

fn discover_config_file(cli: &Cli, env: &impl mockable::Env) -> Result<Option<Utf8PathBuf>> {
    if let Some(explicit) = &cli.config {
        if !explicit.exists() {
            return Err(ConfigError::FileNotFound {
                path: explicit.clone().into_std_path_buf(),
            }
            .into());
        }
        return Ok(Some(explicit.clone()));
    }
    if let Some(from_env) = env.string("CESTX_CONFIG_PATH").map(Utf8PathBuf::from) {
        return Ok(Some(from_env).filter(|path| path.exists()));
    }

    let discovery = ConfigDiscovery::builder("cestx")
        .config_file_name("config.toml")
        .dotfile_name(".cestx.toml")
        .build();
    Ok(discovery
        .candidates()
        .into_iter()
        .filter(|candidate| candidate.exists())
        .find_map(|candidate| Utf8PathBuf::try_from(candidate).ok()))
}

/// Load configuration from the real process environment.
///
/// # Errors
///
/// See [`load_config_with_env`].
pub fn load_config(cli: &Cli) -> Result<AppConfig> {
    load_config_with_env(cli, &mockable::DefaultEnv::new())
}

/// Load configuration with every layer applied, then validate it.
///
/// # Errors
///
/// Returns `ConfigError` when an explicit `--config` path does not exist, the
/// file is malformed, a typed environment variable does not parse, the merge
/// fails, or the merged values are unusable.
pub fn load_config_with_env(cli: &Cli, env: &impl mockable::Env) -> Result<AppConfig> {
    let mut composer = MergeComposer::new();

    let defaults =
        serde_json::to_value(AppConfig::default()).map_err(|e| ConfigError::ParseError {
            message: format!("failed to serialise defaults: {e}"),
        })?;
    composer.push_defaults(defaults);

    if let Some(path) = discover_config_file(cli, env)? {
        load_config_file(&path, &mut composer)?;
    }

    let env_values = collect_env_vars(env)?;
    if !env_values.is_null() {
        composer.push_environment(env_values);
    }

    let cli_overrides = build_cli_overrides(cli);
    if !cli_overrides.is_null() {
        composer.push_cli(cli_overrides);
    }

    let config =
        AppConfig::merge_from_layers(composer.layers()).map_err(ConfigError::OrthoConfig)?;
    config.validate()?;
    Ok(config)
}

fn parse_env_value(spec: &EnvVarSpec, raw: String) -> Result<Value> {
    match spec.var_type {
        EnvVarType::String => Ok(Value::String(raw)),
        EnvVarType::U64 => raw
            .trim()
            .parse::<u64>()
            .map(|number| Value::Number(number.into()))
            .map_err(|_| {
                ConfigError::InvalidValue {
                    field: spec.env_var.to_owned(),
                    reason: format!("expected unsigned integer, got '{raw}'"),
                }
                .into()
            }),
        EnvVarType::List => Ok(Value::Array(
            raw.split(',')
                .map(str::trim)
                .filter(|item| !item.is_empty())
                .map(|item| Value::String(item.to_owned()))
                .collect(),
        )),
    }
}

fn collect_env_vars(env: &impl mockable::Env) -> Result<Value> {
    let mut root = Map::new();
    for spec in ENV_VAR_SPECS {
        let Some(raw) = env.string(spec.env_var) else {
            continue;
        };
        let value = parse_env_value(spec, raw)?;
        insert_at_path(&mut root, spec.path, value);
    }

    if root.is_empty() {
        Ok(Value::Null)
    } else {
        Ok(Value::Object(root))
    }
}

fn insert_at_path(root: &mut Map<String, Value>, path: &[&str], value: Value) {
    let Some((&field, parents)) = path.split_last() else {
        return;
    };

    let mut current = root;
    for &segment in parents {
        let entry = current
            .entry(segment.to_owned())
            .or_insert_with(|| Value::Object(Map::new()));
        let Some(object) = entry.as_object_mut() else {
            return;
        };
        current = object;
    }
    current.insert(field.to_owned(), value);
}

fn build_cli_overrides(cli: &Cli) -> Value {
    let mut overrides = Map::new();
    if let Some(socket) = &cli.engine_socket {
        overrides.insert(String::from("engine_socket"), Value::String(socket.clone()));
    }
    if let Some(level) = &cli.log_level {
        overrides.insert(String::from("log_level"), Value::String(level.clone()));
    }

    if overrides.is_empty() {
        Value::Null
    } else {
        Value::Object(overrides)
    }
}
