pub mod coordinator;
pub mod credentials;
pub mod oauth;
pub mod store;

pub use coordinator::{AuthCoordinator, AuthError};
pub use credentials::{Credentials, now_ms};
pub use oauth::{DeviceChallenge, OAuthClient, OAuthError, PkceChallenge};
pub use store::{CredentialStore, StoreError};
