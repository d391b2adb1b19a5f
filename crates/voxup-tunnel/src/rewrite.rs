//! URL normalization for consuming services
//!
//! Socket-binding tunnels carry WebSocket traffic, so the discovered HTTP
//! URL is rewritten to its WebSocket counterpart. Webhook bindings keep the
//! scheme as discovered.

use url::Url;
use voxup_core::BindingScheme;

/// Rewrite the discovered URL's scheme for the binding target.
pub fn normalize_url(url: &Url, scheme: BindingScheme) -> Url {
    match scheme {
        BindingScheme::Webhook => url.clone(),
        BindingScheme::Socket => {
            let target = match url.scheme() {
                "https" => "wss",
                "http" => "ws",
                _ => return url.clone(),
            };
            let mut rewritten = url.clone();
            // set_scheme only rejects crossing the special/non-special
            // boundary, which http(s) -> ws(s) never does
            if rewritten.set_scheme(target).is_err() {
                return url.clone();
            }
            rewritten
        }
    }
}
