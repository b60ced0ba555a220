use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use crate::catalog::Provider;
use crate::protocol::{ApiKeyStatus, AuthValidateResponse};

pub const ANTHROPIC_API_KEY: &str = "ANTHROPIC_API_KEY";

/// Looks up the API key for a run. Consulted once per run, before the agent loop starts.
pub trait CredentialResolver: Send + Sync {
    fn resolve(&self, provider: Provider, supplied: Option<&str>) -> Option<String>;
}

impl<F> CredentialResolver for F
where
    F: Fn(Provider, Option<&str>) -> Option<String> + Send + Sync,
{
    fn resolve(&self, provider: Provider, supplied: Option<&str>) -> Option<String> {
        self(provider, supplied)
    }
}

type VarLookup = dyn Fn(&str) -> Option<String> + Send + Sync;

/// Resolves credentials from a supplied key or the process environment.
#[derive(Clone)]
pub struct EnvCredentials {
    vars: Arc<VarLookup>,
}

impl EnvCredentials {
    pub fn from_process() -> Self {
        Self {
            vars: Arc::new(|key: &str| std::env::var(key).ok().filter(|v| !v.is_empty())),
        }
    }

    pub fn from_map(vars: HashMap<String, String>) -> Self {
        Self {
            vars: Arc::new(move |key: &str| vars.get(key).cloned()),
        }
    }

    fn var(&self, key: &str) -> Option<String> {
        (self.vars)(key)
    }

    /// Whether a server-side Anthropic key is configured, masked for display.
    pub fn api_key_status(&self) -> ApiKeyStatus {
        match self.var(ANTHROPIC_API_KEY) {
            Some(key) => ApiKeyStatus {
                has_key: true,
                masked_key: Some(mask_key(&key)),
            },
            None => ApiKeyStatus {
                has_key: false,
                masked_key: None,
            },
        }
    }

    pub fn validate(&self, provider: Provider, supplied: Option<&str>) -> AuthValidateResponse {
        match provider {
            Provider::Anthropic => {
                if self.resolve(provider, supplied).is_some() {
                    AuthValidateResponse::valid()
                } else {
                    AuthValidateResponse::invalid(
                        "Enter your API key or set ANTHROPIC_API_KEY in .env file",
                    )
                }
            }
            Provider::Bedrock => {
                let has_keys = self.var("AWS_ACCESS_KEY_ID").is_some()
                    && self.var("AWS_SECRET_ACCESS_KEY").is_some();
                let has_profile = self.var("AWS_PROFILE").is_some()
                    || self.home_file(".aws/credentials").is_some_and(|p| p.exists());
                if has_keys || has_profile {
                    AuthValidateResponse::valid()
                } else {
                    AuthValidateResponse::invalid(
                        "You must have AWS credentials set up to use the Bedrock API.",
                    )
                }
            }
            Provider::Vertex => {
                if self.var("CLOUD_ML_REGION").is_none() {
                    return AuthValidateResponse::invalid(
                        "Set the CLOUD_ML_REGION environment variable to use the Vertex API.",
                    );
                }
                let has_adc = self
                    .var("GOOGLE_APPLICATION_CREDENTIALS")
                    .map(PathBuf::from)
                    .or_else(|| {
                        self.home_file(".config/gcloud/application_default_credentials.json")
                    })
                    .is_some_and(|p| p.exists());
                if has_adc {
                    AuthValidateResponse::valid()
                } else {
                    AuthValidateResponse::invalid(
                        "Your google cloud credentials are not set up correctly.",
                    )
                }
            }
        }
    }

    fn home_file(&self, relative: &str) -> Option<PathBuf> {
        self.var("HOME")
            .or_else(|| self.var("USERPROFILE"))
            .map(|home| PathBuf::from(home).join(relative))
    }
}

impl CredentialResolver for EnvCredentials {
    fn resolve(&self, provider: Provider, supplied: Option<&str>) -> Option<String> {
        if let Some(key) = supplied.filter(|k| !k.is_empty()) {
            return Some(key.to_string());
        }
        match provider {
            Provider::Anthropic => self.var(ANTHROPIC_API_KEY),
            Provider::Bedrock | Provider::Vertex => None,
        }
    }
}

fn mask_key(key: &str) -> String {
    let chars: Vec<char> = key.chars().collect();
    if chars.len() > 14 {
        let head: String = chars[..10].iter().collect();
        let tail: String = chars[chars.len() - 4..].iter().collect();
        format!("{head}...{tail}")
    } else {
        "***".to_string()
    }
}
