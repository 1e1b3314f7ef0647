use anyhow::{bail, Context, Result};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Backend {
    Mongo,
    Memory,
}

#[derive(Clone, Debug)]
pub struct ServiceConfig {
    pub backend: Backend,
    pub mongodb_uri: Option<String>,
    pub database: String,
    pub http_addr: String,
}

impl ServiceConfig {
    pub fn from_env() -> Result<Self> {
        let backend = match std::env::var("LEDGER_BACKEND").as_deref() {
            Ok("memory") => Backend::Memory,
            Ok("mongo") | Err(_) => Backend::Mongo,
            Ok(other) => bail!("Unknown LEDGER_BACKEND: {other}"),
        };
        let mongodb_uri = match backend {
            Backend::Mongo => Some(
                std::env::var("MONGODB_URI")
                    .context("You need to add the MONGODB_URI to the env")?,
            ),
            Backend::Memory => None,
        };
        let database =
            std::env::var("MONGODB_DATABASE").unwrap_or_else(|_| "OpenSplit".to_string());
        let http_addr = std::env::var("HTTP_ADDR").unwrap_or_else(|_| "0.0.0.0:8080".to_string());

        Ok(Self {
            backend,
            mongodb_uri,
            database,
            http_addr,
        })
    }
}
