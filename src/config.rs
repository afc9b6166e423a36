use std::{
    fmt,
    fs::File,
    io::BufReader,
    net::{IpAddr, Ipv4Addr},
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::Context;
use clap::{builder::FalseyValueParser, Parser};
use rocket::{
    data::{ByteUnit, Limits},
    figment::Figment,
};
use serde::Deserialize;
use url::Url;

/// Value shipped in deployment templates for `API_ENDPOINT`. Seeing it means nobody configured
/// the downstream API yet.
pub const PLACEHOLDER_API_ENDPOINT: &str = "https://your-api-endpoint.com/analyze";

const DEFAULT_GITHUB_API_URL: &str = "https://api.github.com";
const DEFAULT_PORT: u16 = 3000;
const DEFAULT_GITHUB_TIMEOUT_SECS: u64 = 10;
const DEFAULT_FORWARD_TIMEOUT_SECS: u64 = 30;
const DEFAULT_MAX_CONCURRENT_FETCHES: usize = 16;
// GitHub stops listing pull request files after 3000 entries, i.e. 30 pages of 100.
const DEFAULT_MAX_FILE_PAGES: u32 = 30;
const DEFAULT_MAX_BODY_MIB: u64 = 25;

#[derive(Debug, Parser)]
#[command(version, about = "Relays GitHub pull request webhooks to an analysis API")]
pub struct Opts {
    /// Optional YAML configuration file, flags and environment variables take precedence over it
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Shared secret used to sign webhook deliveries
    #[arg(long, env = "GITHUB_WEBHOOK_SECRET", hide_env_values = true)]
    pub webhook_secret: Option<String>,

    /// Token used to read pull request files from the GitHub API
    #[arg(long, env = "GITHUB_TOKEN", hide_env_values = true)]
    pub github_token: Option<String>,

    /// URL the assembled payloads are POSTed to
    #[arg(long, env = "API_ENDPOINT")]
    pub api_endpoint: Option<String>,

    #[arg(long, env = "ADDRESS")]
    pub address: Option<IpAddr>,

    #[arg(long, env = "PORT")]
    pub port: Option<u16>,

    /// Base URL of the GitHub REST API, change it for GitHub Enterprise
    #[arg(long, env = "GITHUB_API_URL")]
    pub github_api_url: Option<String>,

    /// Timeout in seconds for each GitHub API request
    #[arg(long, env = "GITHUB_TIMEOUT_SECS")]
    pub github_timeout: Option<u64>,

    /// Timeout in seconds for the request to the downstream API
    #[arg(long, env = "FORWARD_TIMEOUT_SECS")]
    pub forward_timeout: Option<u64>,

    /// How many file contents are fetched at the same time for one pull request
    #[arg(long, env = "MAX_CONCURRENT_FETCHES")]
    pub max_concurrent_fetches: Option<usize>,

    /// How many pages of 100 files are listed at most for one pull request
    #[arg(long, env = "MAX_FILE_PAGES")]
    pub max_file_pages: Option<u32>,

    /// Largest accepted webhook body, in mebibytes
    #[arg(long, env = "MAX_BODY_MIB")]
    pub max_body_mib: Option<u64>,

    /// Refuse to start when the secret, token or endpoint is missing
    #[arg(long, env = "STRICT_CONFIG", value_parser = FalseyValueParser::new())]
    pub strict: bool,
}

/// Contents of the optional YAML file, every key can be omitted.
#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct ConfigFile {
    webhook_secret: Option<String>,
    github_token: Option<String>,
    api_endpoint: Option<String>,
    address: Option<IpAddr>,
    port: Option<u16>,
    github_api_url: Option<String>,
    github_timeout: Option<u64>,
    forward_timeout: Option<u64>,
    max_concurrent_fetches: Option<usize>,
    max_file_pages: Option<u32>,
    max_body_mib: Option<u64>,
    strict: Option<bool>,
}

impl ConfigFile {
    fn read(path: &Path) -> anyhow::Result<Self> {
        let file =
            File::open(path).with_context(|| format!("couldn't open {}:", path.display()))?;
        serde_yaml::from_reader(BufReader::new(file)).context("couldn't parse config file")
    }
}

/// Settings shared read-only by every request handler.
#[derive(Clone)]
pub struct RelayConfig {
    /// Key for the `X-Hub-Signature-256` HMAC. Without it every delivery fails verification.
    pub webhook_secret: Option<String>,
    /// Bearer token for the GitHub API. Requests are sent anonymously without it.
    pub github_token: Option<String>,
    /// Downstream analysis API. `None` when unset or still the placeholder.
    pub api_endpoint: Option<Url>,
    pub address: IpAddr,
    pub port: u16,
    pub github_api_url: Url,
    pub github_timeout: Duration,
    pub forward_timeout: Duration,
    pub max_concurrent_fetches: usize,
    pub max_file_pages: u32,
    pub max_body: ByteUnit,
    pub strict: bool,
}

impl RelayConfig {
    /// Merges command line flags, environment variables and the optional config file.
    pub fn load(opts: Opts) -> anyhow::Result<Self> {
        let file = match &opts.config {
            Some(path) => ConfigFile::read(path)?,
            None => ConfigFile::default(),
        };

        let api_endpoint = match non_empty(opts.api_endpoint.or(file.api_endpoint)) {
            Some(endpoint) if endpoint == PLACEHOLDER_API_ENDPOINT => None,
            Some(endpoint) => Some(
                Url::parse(&endpoint)
                    .with_context(|| format!("API_ENDPOINT `{}` isn't a valid URL", endpoint))?,
            ),
            None => None,
        };

        let github_api_url = non_empty(opts.github_api_url.or(file.github_api_url))
            .unwrap_or_else(|| DEFAULT_GITHUB_API_URL.to_owned());
        let github_api_url = Url::parse(&github_api_url).with_context(|| {
            format!("GITHUB_API_URL `{}` isn't a valid URL", github_api_url)
        })?;

        let max_concurrent_fetches = opts
            .max_concurrent_fetches
            .or(file.max_concurrent_fetches)
            .unwrap_or(DEFAULT_MAX_CONCURRENT_FETCHES);
        anyhow::ensure!(
            max_concurrent_fetches > 0,
            "max_concurrent_fetches must be at least 1"
        );

        let max_file_pages = opts
            .max_file_pages
            .or(file.max_file_pages)
            .unwrap_or(DEFAULT_MAX_FILE_PAGES);
        anyhow::ensure!(max_file_pages > 0, "max_file_pages must be at least 1");

        Ok(Self {
            webhook_secret: non_empty(opts.webhook_secret.or(file.webhook_secret)),
            github_token: non_empty(opts.github_token.or(file.github_token)),
            api_endpoint,
            address: opts
                .address
                .or(file.address)
                .unwrap_or(IpAddr::V4(Ipv4Addr::UNSPECIFIED)),
            port: opts.port.or(file.port).unwrap_or(DEFAULT_PORT),
            github_api_url,
            github_timeout: Duration::from_secs(
                opts.github_timeout
                    .or(file.github_timeout)
                    .unwrap_or(DEFAULT_GITHUB_TIMEOUT_SECS),
            ),
            forward_timeout: Duration::from_secs(
                opts.forward_timeout
                    .or(file.forward_timeout)
                    .unwrap_or(DEFAULT_FORWARD_TIMEOUT_SECS),
            ),
            max_concurrent_fetches,
            max_file_pages,
            max_body: ByteUnit::Mebibyte(
                opts.max_body_mib
                    .or(file.max_body_mib)
                    .unwrap_or(DEFAULT_MAX_BODY_MIB),
            ),
            strict: opts.strict || file.strict.unwrap_or(false),
        })
    }

    /// Settings that are missing but needed for the relay to do anything useful.
    pub fn warnings(&self) -> Vec<&'static str> {
        let mut warnings = Vec::new();
        if self.webhook_secret.is_none() {
            warnings.push("GITHUB_WEBHOOK_SECRET is not set, every webhook will be rejected");
        }
        if self.github_token.is_none() {
            warnings.push("GITHUB_TOKEN is not set, GitHub API requests will be anonymous");
        }
        if self.api_endpoint.is_none() {
            warnings.push("API_ENDPOINT is not configured, payloads can't be forwarded");
        }
        warnings
    }

    /// Warnings to log before starting. In strict mode any of them is an error instead.
    pub fn check_startup(&self) -> anyhow::Result<Vec<&'static str>> {
        let warnings = self.warnings();
        if self.strict && !warnings.is_empty() {
            anyhow::bail!(
                "refusing to start with an incomplete configuration in strict mode: {}",
                warnings.join("; ")
            );
        }
        Ok(warnings)
    }

    /// Rocket settings derived from this config.
    pub fn figment(&self) -> Figment {
        rocket::Config::figment()
            .merge(("address", self.address))
            .merge(("port", self.port))
            .merge(("limits", Limits::default().limit("json", self.max_body)))
    }
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            webhook_secret: None,
            github_token: None,
            api_endpoint: None,
            address: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port: DEFAULT_PORT,
            github_api_url: Url::parse(DEFAULT_GITHUB_API_URL).expect("default URL is valid"),
            github_timeout: Duration::from_secs(DEFAULT_GITHUB_TIMEOUT_SECS),
            forward_timeout: Duration::from_secs(DEFAULT_FORWARD_TIMEOUT_SECS),
            max_concurrent_fetches: DEFAULT_MAX_CONCURRENT_FETCHES,
            max_file_pages: DEFAULT_MAX_FILE_PAGES,
            max_body: ByteUnit::Mebibyte(DEFAULT_MAX_BODY_MIB),
            strict: false,
        }
    }
}

// secrets stay out of the logs
impl fmt::Debug for RelayConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fn redacted(value: &Option<String>) -> &'static str {
            match value {
                Some(_) => "<redacted>",
                None => "<unset>",
            }
        }

        f.debug_struct("RelayConfig")
            .field("webhook_secret", &redacted(&self.webhook_secret))
            .field("github_token", &redacted(&self.github_token))
            .field("api_endpoint", &self.api_endpoint.as_ref().map(Url::as_str))
            .field("address", &self.address)
            .field("port", &self.port)
            .field("github_api_url", &self.github_api_url.as_str())
            .field("github_timeout", &self.github_timeout)
            .field("forward_timeout", &self.forward_timeout)
            .field("max_concurrent_fetches", &self.max_concurrent_fetches)
            .field("max_file_pages", &self.max_file_pages)
            .field("max_body", &self.max_body)
            .field("strict", &self.strict)
            .finish()
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}

#[cfg(test)]
mod tests {
    use std::{io::Write, sync::Mutex};

    use super::*;

    const RELAY_ENV_VARS: &[&str] = &[
        "GITHUB_WEBHOOK_SECRET",
        "GITHUB_TOKEN",
        "API_ENDPOINT",
        "ADDRESS",
        "PORT",
        "GITHUB_API_URL",
        "GITHUB_TIMEOUT_SECS",
        "FORWARD_TIMEOUT_SECS",
        "MAX_CONCURRENT_FETCHES",
        "MAX_FILE_PAGES",
        "MAX_BODY_MIB",
        "STRICT_CONFIG",
    ];

    // the environment is shared by every test thread
    static ENV_LOCK: Mutex<()> = Mutex::new(());

    /// Parses `args` with exactly `env` set among the relay's variables.
    fn opts_with_env(env: &[(&str, &str)], args: &[&str]) -> Opts {
        let _guard = ENV_LOCK.lock().unwrap_or_else(|e| e.into_inner());
        for var in RELAY_ENV_VARS {
            std::env::remove_var(var);
        }
        for (var, value) in env {
            std::env::set_var(var, value);
        }

        let parsed = Opts::try_parse_from(std::iter::once("prrelay").chain(args.iter().copied()));

        for (var, _) in env {
            std::env::remove_var(var);
        }
        parsed.expect("arguments should parse")
    }

    fn opts(args: &[&str]) -> Opts {
        opts_with_env(&[], args)
    }

    fn complete_flags() -> Vec<&'static str> {
        vec![
            "--webhook-secret",
            "s3cr3t",
            "--github-token",
            "ghp_token",
            "--api-endpoint",
            "http://analysis.internal/review",
        ]
    }

    #[test]
    fn flags_override_defaults() {
        let config = RelayConfig::load(opts(&[
            "--webhook-secret",
            "s3cr3t",
            "--github-token",
            "ghp_token",
            "--api-endpoint",
            "http://analysis.internal/review",
            "--port",
            "8080",
            "--forward-timeout",
            "5",
        ]))
        .unwrap();

        assert_eq!(config.webhook_secret.as_deref(), Some("s3cr3t"));
        assert_eq!(config.github_token.as_deref(), Some("ghp_token"));
        assert_eq!(
            config.api_endpoint.as_ref().map(Url::as_str),
            Some("http://analysis.internal/review")
        );
        assert_eq!(config.port, 8080);
        assert_eq!(config.forward_timeout, Duration::from_secs(5));
        assert_eq!(config.github_timeout, Duration::from_secs(10));
        assert!(config.warnings().is_empty());
    }

    #[test]
    fn placeholder_endpoint_counts_as_unconfigured() {
        let config =
            RelayConfig::load(opts(&["--api-endpoint", PLACEHOLDER_API_ENDPOINT])).unwrap();
        assert!(config.api_endpoint.is_none());
    }

    #[test]
    fn empty_secret_counts_as_unset() {
        let config = RelayConfig::load(opts(&["--webhook-secret", "  "])).unwrap();
        assert!(config.webhook_secret.is_none());
    }

    #[test]
    fn invalid_endpoint_is_an_error() {
        assert!(RelayConfig::load(opts(&["--api-endpoint", "not a url"])).is_err());
    }

    #[test]
    fn zero_concurrency_is_rejected() {
        assert!(RelayConfig::load(opts(&["--max-concurrent-fetches", "0"])).is_err());
    }

    #[test]
    fn missing_settings_produce_warnings() {
        let config = RelayConfig::default();
        assert_eq!(config.warnings().len(), 3);
    }

    #[test]
    fn config_file_fills_in_unset_flags() {
        let path = std::env::temp_dir().join(format!("prrelay-config-{}.yaml", std::process::id()));
        let mut file = File::create(&path).unwrap();
        writeln!(
            file,
            "webhook_secret: from-file\nport: 4000\napi_endpoint: http://localhost:9000/analyze"
        )
        .unwrap();

        let config = RelayConfig::load(opts(&[
            "--config",
            path.to_str().unwrap(),
            "--port",
            "5000",
        ]))
        .unwrap();
        std::fs::remove_file(&path).unwrap();

        assert_eq!(config.webhook_secret.as_deref(), Some("from-file"));
        assert_eq!(config.port, 5000);
        assert_eq!(
            config.api_endpoint.as_ref().map(Url::as_str),
            Some("http://localhost:9000/analyze")
        );
    }

    #[test]
    fn debug_output_redacts_secrets() {
        let config = RelayConfig {
            webhook_secret: Some("hunter2".to_owned()),
            ..RelayConfig::default()
        };
        let debug = format!("{:?}", config);
        assert!(!debug.contains("hunter2"));
        assert!(debug.contains("<redacted>"));
    }

    #[test]
    fn environment_fills_in_unset_flags() {
        let config = RelayConfig::load(opts_with_env(
            &[("GITHUB_TIMEOUT_SECS", "5"), ("GITHUB_WEBHOOK_SECRET", "envsecret")],
            &["--webhook-secret", "flag-secret"],
        ))
        .unwrap();

        assert_eq!(config.webhook_secret.as_deref(), Some("flag-secret"));
        assert_eq!(config.github_timeout, Duration::from_secs(5));
    }

    #[test]
    fn strict_accepts_numeric_env_values() {
        assert!(opts_with_env(&[("STRICT_CONFIG", "1")], &[]).strict);
        assert!(!opts_with_env(&[("STRICT_CONFIG", "0")], &[]).strict);
        assert!(!opts_with_env(&[("STRICT_CONFIG", "false")], &[]).strict);
        assert!(opts_with_env(&[("STRICT_CONFIG", "true")], &[]).strict);
        assert!(opts(&["--strict"]).strict);
        assert!(!opts(&[]).strict);
    }

    #[test]
    fn strict_startup_fails_on_incomplete_config() {
        let config = RelayConfig::load(opts(&["--strict"])).unwrap();
        let err = config.check_startup().unwrap_err();
        assert!(err.to_string().contains("GITHUB_WEBHOOK_SECRET"), "{}", err);
    }

    #[test]
    fn strict_startup_passes_on_complete_config() {
        let mut args = complete_flags();
        args.push("--strict");
        let config = RelayConfig::load(opts(&args)).unwrap();
        assert!(config.check_startup().unwrap().is_empty());
    }

    #[test]
    fn lenient_startup_only_warns() {
        let config = RelayConfig::load(opts(&[])).unwrap();
        assert_eq!(config.check_startup().unwrap().len(), 3);
    }
}
