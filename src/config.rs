use std::env;
use std::path::PathBuf;

use anyhow::{anyhow, Result};

use crate::line::DEFAULT_REPLY_ENDPOINT;

pub const DEFAULT_OPENAI_BASE_URL: &str = "https://api.openai.com/v1";
pub const DEFAULT_OPENAI_MODEL: &str = "gpt-4o-mini";

#[derive(Debug, Clone)]
pub struct AppConfig {
    /// Shared secret for webhook signature verification. When absent every
    /// POST is rejected (and a warning is logged at startup).
    pub channel_secret: Option<String>,
    /// Bearer token for the reply endpoint.
    pub channel_token: Option<String>,
    pub reply_endpoint: String,
    /// Credential for the generation backend. Absent means generation
    /// degrades to a static notice instead of failing requests.
    pub openai_api_key: Option<String>,
    pub openai_base_url: String,
    pub openai_model: String,
    pub openai_timeout_ms: u64,
    pub knowledge_dir: PathBuf,
    pub search_top_k: usize,
    pub scope_ttl_secs: u64,
}

impl AppConfig {
    pub fn from_env() -> Result<Self> {
        let channel_secret = non_empty_env("LINE_CHANNEL_SECRET");
        let channel_token = non_empty_env("LINE_CHANNEL_ACCESS_TOKEN");
        let reply_endpoint = non_empty_env("LINE_REPLY_ENDPOINT")
            .unwrap_or_else(|| DEFAULT_REPLY_ENDPOINT.to_string());

        let openai_api_key = non_empty_env("OPENAI_API_KEY");
        let openai_base_url = non_empty_env("OPENAI_BASE_URL")
            .unwrap_or_else(|| DEFAULT_OPENAI_BASE_URL.to_string());
        let openai_model =
            non_empty_env("OPENAI_MODEL").unwrap_or_else(|| DEFAULT_OPENAI_MODEL.to_string());
        let openai_timeout_ms = parse_optional_u64("OPENAI_TIMEOUT_MS")?.unwrap_or(30_000);

        let knowledge_dir = non_empty_env("KNOWLEDGE_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("data/knowledge"));
        let search_top_k = parse_optional_u64("SEARCH_TOP_K")?.unwrap_or(6) as usize;
        let scope_ttl_secs = parse_optional_u64("SCOPE_TTL_SECS")?.unwrap_or(30 * 60);

        Ok(Self {
            channel_secret,
            channel_token,
            reply_endpoint,
            openai_api_key,
            openai_base_url,
            openai_model,
            openai_timeout_ms,
            knowledge_dir,
            search_top_k,
            scope_ttl_secs,
        })
    }
}

fn non_empty_env(var: &str) -> Option<String> {
    env::var(var)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn parse_optional_u64(var: &str) -> Result<Option<u64>> {
    match env::var(var) {
        Ok(value) if !value.trim().is_empty() => value
            .trim()
            .parse::<u64>()
            .map(Some)
            .map_err(|_| anyhow!("{} must be a positive integer", var)),
        Ok(_) => Ok(None),
        Err(env::VarError::NotPresent) => Ok(None),
        Err(err) => Err(err.into()),
    }
}
