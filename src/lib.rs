// Authenticated clients and single-flight refresh
pub mod cache;

// TOML + environment configuration
pub mod config;

// Encrypted token storage
pub mod credentials;

// Error taxonomy
pub mod error;

// Produced interface
pub mod manager;

// Authorization code flow and callback listener
pub mod oauth;

pub use cache::{AuthenticatedClient, CredentialCache};
pub use credentials::{Credential, EncryptedTokenStore};
pub use error::{CredentialError, RefreshFailure, Result};
pub use manager::{AuthStatus, CredentialManager};
