use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Environment variable selecting the default log level
pub const ENV_VAR: &str = "MICROWORK_ENV";

/// Log level per deployment environment
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogProfile {
    Production,
    Test,
    Development,
}

impl LogProfile {
    pub fn from_env() -> Self {
        Self::parse(std::env::var(ENV_VAR).ok().as_deref())
    }

    pub fn parse(value: Option<&str>) -> Self {
        match value {
            Some("production") => Self::Production,
            Some("test") => Self::Test,
            _ => Self::Development,
        }
    }

    pub fn directive(&self) -> &'static str {
        match self {
            Self::Production => "microwork=info",
            Self::Test => "microwork=error",
            Self::Development => "microwork=debug",
        }
    }
}

/// Install a fmt subscriber. `RUST_LOG` wins over the `MICROWORK_ENV` profile.
///
/// Returns false when a global subscriber was already installed.
pub fn init_tracing() -> bool {
    let profile = LogProfile::from_env();
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| profile.directive().into()))
        .with(tracing_subscriber::fmt::layer())
        .try_init()
        .is_ok()
}
