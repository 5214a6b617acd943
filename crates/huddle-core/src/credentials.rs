use std::sync::OnceLock;

use async_trait::async_trait;
use regex::Regex;
use serde::Deserialize;

use crate::errors::HuddleError;

/// Prefix for channels derived from a recipient identity.
const CHANNEL_PREFIX: &str = "call-";

/// Longest channel name accepted by the media backend.
const MAX_CHANNEL_LEN: usize = 64;

/// Everything needed to join a channel.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Credentials {
    pub app_id: String,
    pub channel_name: String,
    pub token: String,
    #[serde(default)]
    pub uid: u32,
}

/// Issues join credentials for a channel.
#[async_trait]
pub trait CredentialProvider: Send + Sync {
    async fn fetch_credentials(&self, channel: &str) -> Result<Credentials, HuddleError>;
}

/// Derive the channel name for a call to `recipient`.
///
/// Characters the media backend rejects are replaced with `_`.
pub fn channel_for_recipient(recipient: &str) -> Result<String, HuddleError> {
    static INVALID: OnceLock<Regex> = OnceLock::new();
    let recipient = recipient.trim();
    if recipient.is_empty() {
        return Err(HuddleError::InvalidTarget("empty recipient".into()));
    }
    let re = INVALID.get_or_init(|| Regex::new(r"[^A-Za-z0-9_-]").unwrap());
    let mut channel = format!("{CHANNEL_PREFIX}{}", re.replace_all(recipient, "_"));
    // Only ASCII survives the replacement, so byte truncation is safe.
    channel.truncate(MAX_CHANNEL_LEN);
    Ok(channel)
}

/// The channel to join: an explicit override wins over the derived name.
pub fn resolve_channel(
    recipient: &str,
    channel_override: Option<&str>,
) -> Result<String, HuddleError> {
    match channel_override.map(str::trim) {
        Some(channel) if !channel.is_empty() => Ok(channel.to_string()),
        _ => channel_for_recipient(recipient),
    }
}

/// Caller-supplied values that may short-circuit the credential fetch.
#[derive(Debug, Clone, Default)]
pub struct CredentialRequest {
    pub channel: String,
    pub preset_token: Option<String>,
    pub preset_app_id: Option<String>,
    pub preset_uid: Option<u32>,
}

impl CredentialRequest {
    /// Use the preset token and app id when both are present, otherwise ask
    /// `provider`. A preset uid always wins over a fetched one.
    pub async fn resolve(
        &self,
        provider: &dyn CredentialProvider,
    ) -> Result<Credentials, HuddleError> {
        if let (Some(token), Some(app_id)) = (&self.preset_token, &self.preset_app_id) {
            tracing::info!("using preset credentials for channel {}", self.channel);
            return Ok(Credentials {
                app_id: app_id.clone(),
                channel_name: self.channel.clone(),
                token: token.clone(),
                uid: self.preset_uid.unwrap_or(0),
            });
        }

        let mut credentials = provider.fetch_credentials(&self.channel).await?;
        if let Some(uid) = self.preset_uid {
            credentials.uid = uid;
        }
        Ok(credentials)
    }
}

/// Fetches credentials from the HTTP token service.
pub struct TokenServiceClient {
    base_url: String,
    http: reqwest::Client,
}

impl TokenServiceClient {
    /// `base_url` is the service root, e.g. `https://api.example.com/v1`.
    pub fn new(base_url: &str) -> Result<Self, HuddleError> {
        let parsed = url::Url::parse(base_url.trim())
            .map_err(|e| HuddleError::Http(format!("invalid token service url '{base_url}': {e}")))?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(HuddleError::Http(format!(
                "token service url must be http(s), got '{}'",
                parsed.scheme()
            )));
        }
        Ok(Self {
            base_url: base_url.trim().trim_end_matches('/').to_string(),
            http: reqwest::Client::new(),
        })
    }

    /// Build a client from settings, if a token service is configured.
    pub fn from_settings(
        settings: &crate::settings::CallSettings,
    ) -> Option<Result<Self, HuddleError>> {
        settings.token_service_url.as_deref().map(Self::new)
    }

    fn token_url(&self, channel: &str) -> String {
        format!(
            "{}/rtc-token?channel={}",
            self.base_url,
            urlencoding::encode(channel)
        )
    }

    fn parse_response(body: &str) -> Result<Credentials, HuddleError> {
        serde_json::from_str(body)
            .map_err(|e| HuddleError::Credential(format!("invalid token service response: {e}")))
    }
}

#[async_trait]
impl CredentialProvider for TokenServiceClient {
    async fn fetch_credentials(&self, channel: &str) -> Result<Credentials, HuddleError> {
        let url = self.token_url(channel);
        tracing::info!("requesting call token: {url}");

        let resp = self
            .http
            .get(&url)
            .send()
            .await
            .map_err(|e| HuddleError::Credential(format!("token service unreachable: {e}")))?;

        if !resp.status().is_success() {
            return Err(HuddleError::Credential(format!(
                "token service returned status {}",
                resp.status()
            )));
        }

        let body = resp
            .text()
            .await
            .map_err(|e| HuddleError::Credential(format!("token service read failed: {e}")))?;
        Self::parse_response(&body)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeCredentials;

    #[test]
    fn channel_derived_from_recipient() {
        assert_eq!(channel_for_recipient("user42").unwrap(), "call-user42");
    }

    #[test]
    fn channel_replaces_invalid_characters() {
        assert_eq!(
            channel_for_recipient(" alice@example.com ").unwrap(),
            "call-alice_example_com"
        );
        assert_eq!(channel_for_recipient("zoë").unwrap(), "call-zo_");
    }

    #[test]
    fn channel_is_truncated() {
        let long = "x".repeat(200);
        assert_eq!(channel_for_recipient(&long).unwrap().len(), 64);
    }

    #[test]
    fn empty_recipient_is_rejected() {
        assert!(channel_for_recipient("").is_err());
        assert!(channel_for_recipient("   ").is_err());
    }

    #[test]
    fn override_wins_over_recipient() {
        assert_eq!(resolve_channel("bob", Some("team-sync")).unwrap(), "team-sync");
        assert_eq!(resolve_channel("bob", Some("  ")).unwrap(), "call-bob");
        assert_eq!(resolve_channel("bob", None).unwrap(), "call-bob");
        assert!(resolve_channel("", None).is_err());
    }

    #[test]
    fn token_url_encodes_channel() {
        let client = TokenServiceClient::new("https://api.example.com/v1/").unwrap();
        assert_eq!(
            client.token_url("call a&b"),
            "https://api.example.com/v1/rtc-token?channel=call%20a%26b"
        );
    }

    #[test]
    fn token_service_url_must_be_http() {
        assert!(TokenServiceClient::new("not a url").is_err());
        assert!(TokenServiceClient::new("ftp://example.com").is_err());
        assert!(TokenServiceClient::new("http://localhost:8080").is_ok());
    }

    #[test]
    fn parse_token_service_response() {
        let creds = TokenServiceClient::parse_response(
            r#"{"appId":"app","channelName":"call-bob","token":"tok","uid":7}"#,
        )
        .unwrap();
        assert_eq!(creds.app_id, "app");
        assert_eq!(creds.channel_name, "call-bob");
        assert_eq!(creds.token, "tok");
        assert_eq!(creds.uid, 7);
    }

    #[test]
    fn parse_invalid_response_is_credential_error() {
        let err = TokenServiceClient::parse_response(r#"{"token":"tok"}"#).unwrap_err();
        assert!(matches!(err, HuddleError::Credential(_)));
    }

    #[tokio::test]
    async fn presets_skip_the_fetch() {
        let provider = FakeCredentials::new();
        let request = CredentialRequest {
            channel: "call-bob".into(),
            preset_token: Some("preset".into()),
            preset_app_id: Some("app".into()),
            preset_uid: Some(9),
        };
        let creds = request.resolve(&provider).await.unwrap();
        assert_eq!(creds.token, "preset");
        assert_eq!(creds.uid, 9);
        assert_eq!(provider.fetch_count(), 0);
    }

    #[tokio::test]
    async fn token_without_app_id_still_fetches() {
        let provider = FakeCredentials::new();
        let request = CredentialRequest {
            channel: "call-bob".into(),
            preset_token: Some("preset".into()),
            preset_uid: Some(3),
            ..Default::default()
        };
        let creds = request.resolve(&provider).await.unwrap();
        assert_eq!(provider.fetch_count(), 1);
        assert_eq!(creds.channel_name, "call-bob");
        assert_eq!(creds.uid, 3);
    }
}
