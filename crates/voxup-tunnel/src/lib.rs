//! Tunnel provider adapters
//!
//! Starts an outbound tunnel client process for a local port, discovers the
//! dynamically assigned public URL, and normalizes it for the consuming
//! service. Two providers are supported: ngrok (discovery via its local
//! control-plane HTTP API) and cloudflared (discovery by scanning the
//! client's own log output). Adding a provider means implementing
//! [`TunnelProvider`]; the supervisor never sees provider specifics.

pub mod cloudflared;
pub mod handle;
pub mod ngrok;
pub mod provider;
pub mod rewrite;

pub use cloudflared::CloudflaredProvider;
pub use handle::TunnelHandle;
pub use ngrok::NgrokProvider;
pub use provider::{provider_for, spawn_args, TunnelError, TunnelProvider};
pub use rewrite::normalize_url;
