use std::str::FromStr;
use std::time;

use envconfig::Envconfig;

use taskforge_core::retry::OnAttemptsExceeded;

#[derive(Envconfig, Clone)]
pub struct Config {
    #[envconfig(from = "BIND_HOST", default = "0.0.0.0")]
    pub host: String,

    #[envconfig(from = "BIND_PORT", default = "3301")]
    pub port: u16,

    #[envconfig(default = "worker")]
    pub worker_name: String,

    #[envconfig(default = "100")]
    pub poll_interval: EnvMsDuration,

    #[envconfig(default = "1024")]
    pub max_concurrent_jobs: usize,

    #[envconfig(nested = true)]
    pub retry: RetryConfig,
}

impl Config {
    /// Produce a host:port address for binding a TcpListener.
    pub fn bind(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct EnvMsDuration(pub time::Duration);

#[derive(Debug, PartialEq, Eq)]
pub struct ParseEnvMsDurationError;

impl FromStr for EnvMsDuration {
    type Err = ParseEnvMsDurationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let ms = s.parse::<u64>().map_err(|_| ParseEnvMsDurationError)?;
        Ok(EnvMsDuration(time::Duration::from_millis(ms)))
    }
}

#[derive(Envconfig, Clone)]
pub struct RetryConfig {
    #[envconfig(default = "10")]
    pub attempts: u32,

    #[envconfig(default = "fail")]
    pub on_attempts_exceeded: EnvOnAttemptsExceeded,

    #[envconfig(default = "true")]
    pub log_events: bool,
}

#[derive(Debug, Clone, Copy)]
pub struct EnvOnAttemptsExceeded(pub OnAttemptsExceeded);

#[derive(Debug, PartialEq, Eq)]
pub struct ParseOnAttemptsExceededError(String);

impl FromStr for EnvOnAttemptsExceeded {
    type Err = ParseOnAttemptsExceededError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "fail" => Ok(EnvOnAttemptsExceeded(OnAttemptsExceeded::Fail)),
            "delete" => Ok(EnvOnAttemptsExceeded(OnAttemptsExceeded::Delete)),
            other => Err(ParseOnAttemptsExceededError(other.to_owned())),
        }
    }
}
