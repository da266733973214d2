pub mod device_identity;
pub mod webhook;

pub use device_identity::DeviceIdentityProvider;
pub use webhook::{sign_payload, WebhookError, WebhookEvent, WebhookVerifier};
