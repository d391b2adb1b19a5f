//! Phone-provider webhook registration
//!
//! Once a webhook-facing public URL is discovered, the incoming phone
//! number is pointed at `<public_url>/voice`. This is fire-and-forget:
//! failures are logged, never retried, and never propagate.

use tracing::{info, warn};
use url::Url;
use voxup_core::ProviderCredentials;

const API_BASE: &str = "https://api.twilio.com/2010-04-01";

/// The inbound call handler URL for a discovered webhook base URL.
pub fn voice_webhook_url(public_url: &Url) -> String {
    format!("{}/voice", public_url.as_str().trim_end_matches('/'))
}

fn update_endpoint(base: &str, creds: &ProviderCredentials) -> String {
    format!(
        "{}/Accounts/{}/IncomingPhoneNumbers/{}.json",
        base, creds.account_sid, creds.phone_sid
    )
}

/// Register `<public_url>/voice` as the voice webhook for the configured
/// phone number.
pub async fn register_voice_webhook(creds: &ProviderCredentials, public_url: &Url) {
    let voice_url = voice_webhook_url(public_url);
    let endpoint = update_endpoint(API_BASE, creds);

    let client = reqwest::Client::new();
    let result = client
        .post(&endpoint)
        .basic_auth(&creds.account_sid, Some(&creds.auth_token))
        .form(&[("VoiceUrl", voice_url.as_str()), ("VoiceMethod", "POST")])
        .send()
        .await;

    match result {
        Ok(response) if response.status().is_success() => {
            info!(%voice_url, "voice webhook registered");
        }
        Ok(response) => {
            warn!(status = %response.status(), %voice_url, "voice webhook registration rejected");
        }
        Err(e) => {
            warn!(error = %e, %voice_url, "voice webhook registration failed");
        }
    }
}
