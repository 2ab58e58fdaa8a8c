use std::sync::OnceLock;
use std::time::Duration;

use base64::Engine;
use url::Url;

use crate::error::{Error, Result};
use crate::service::ServiceKind;

const DEFAULT_TIMEOUT: u64 = 30;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Credentials {
    Basic { user: String, password: String },
    Token(String),
}

impl Credentials {
    /// Value for an `Authorization` header.
    pub fn header_value(&self) -> String {
        match self {
            Credentials::Basic { user, password } => {
                let encoded = base64::engine::general_purpose::STANDARD
                    .encode(format!("{}:{}", user, password).as_bytes());
                format!("Basic {}", encoded)
            }
            Credentials::Token(token) => format!("Bearer {}", token),
        }
    }
}

/// Connection settings for one tracker instance.
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    pub base: String,
    pub kind: ServiceKind,
    pub connection: Option<String>,
    pub user: Option<String>,
    pub password: Option<String>,
    pub auth_token: Option<String>,
    pub verify: bool,
    pub timeout: Option<Duration>,
    pub concurrent: usize,
    pub max_results: Option<usize>,
    pub verbose: bool,
    pub suffix: Option<String>,
}

impl ServiceConfig {
    pub fn new(base: impl Into<String>, kind: ServiceKind) -> Result<Self> {
        let base = base.into();

        let parsed = Url::parse(&base)
            .map_err(|_| Error::Config(format!("invalid base URL: {}", base)))?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(Error::Config(format!("unsupported URL scheme: {}", parsed.scheme())));
        }

        Ok(Self {
            base: base.trim_end_matches('/').to_string(),
            kind,
            connection: None,
            user: None,
            password: None,
            auth_token: None,
            verify: true,
            timeout: Some(Duration::from_secs(DEFAULT_TIMEOUT)),
            concurrent: num_cpus::get() * 5,
            max_results: None,
            verbose: false,
            suffix: None,
        })
    }

    /// Reads `BITE_URL`, `BITE_SERVICE` and optional credentials from the
    /// environment (after loading `.env`).
    pub fn from_env() -> Result<Self> {
        use std::env;

        dotenv::dotenv().ok();

        let base = env::var("BITE_URL")
            .map_err(|_| Error::Config("BITE_URL not found in environment".to_string()))?;
        let kind = env::var("BITE_SERVICE")
            .map_err(|_| Error::Config("BITE_SERVICE not found in environment".to_string()))?
            .parse::<ServiceKind>()?;

        let mut config = Self::new(base, kind)?;
        config.user = env::var("BITE_USER").ok();
        config.password = env::var("BITE_PASSWORD").ok();
        config.auth_token = env::var("BITE_TOKEN").ok();
        if let Ok(timeout) = env::var("BITE_TIMEOUT") {
            let secs = timeout
                .parse::<u64>()
                .map_err(|_| Error::Config(format!("invalid timeout: {}", timeout)))?;
            config = config.timeout(secs);
        }
        Ok(config)
    }

    pub fn connection(mut self, name: impl Into<String>) -> Self {
        self.connection = Some(name.into());
        self
    }

    pub fn user(mut self, user: impl Into<String>) -> Self {
        let mut user = user.into();
        if let Some(suffix) = &self.suffix {
            if !user.ends_with(suffix.as_str()) {
                user.push_str(suffix);
            }
        }
        self.user = Some(user);
        self
    }

    pub fn password(mut self, password: impl Into<String>) -> Self {
        self.password = Some(password.into());
        self
    }

    pub fn auth_token(mut self, token: impl Into<String>) -> Self {
        self.auth_token = Some(token.into());
        self
    }

    pub fn verify(mut self, verify: bool) -> Self {
        self.verify = verify;
        self
    }

    /// A timeout of zero disables it.
    pub fn timeout(mut self, secs: u64) -> Self {
        self.timeout = (secs > 0).then(|| Duration::from_secs(secs));
        self
    }

    pub fn concurrent(mut self, concurrent: usize) -> Self {
        self.concurrent = concurrent.max(1);
        self
    }

    pub fn max_results(mut self, max_results: usize) -> Self {
        self.max_results = Some(max_results);
        self
    }

    pub fn verbose(mut self, verbose: bool) -> Self {
        self.verbose = verbose;
        self
    }

    pub fn suffix(mut self, suffix: impl Into<String>) -> Self {
        self.suffix = Some(suffix.into());
        self
    }

    /// User/password pair when both are known.
    pub fn credentials(&self) -> Option<Credentials> {
        match (&self.user, &self.password) {
            (Some(user), Some(password)) => Some(Credentials::Basic {
                user: user.clone(),
                password: password.clone(),
            }),
            _ => None,
        }
    }

    pub fn url(&self) -> Result<Url> {
        Url::parse(&self.base).map_err(|_| Error::Config(format!("invalid base URL: {}", self.base)))
    }

    /// Name used for per-connection cache files.
    pub fn connection_name(&self) -> String {
        match &self.connection {
            Some(name) => name.clone(),
            None => self
                .base
                .split("://")
                .last()
                .unwrap_or(&self.base)
                .replace(['/', ':'], "_"),
        }
    }
}

/// Process-wide display settings, loaded once.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Constants {
    pub columns: usize,
}

impl Constants {
    pub fn get() -> &'static Constants {
        static CONSTANTS: OnceLock<Constants> = OnceLock::new();
        CONSTANTS.get_or_init(|| Constants {
            columns: std::env::var("COLUMNS")
                .ok()
                .and_then(|c| c.parse().ok())
                .filter(|c| *c > 0)
                .unwrap_or(80),
        })
    }
}
