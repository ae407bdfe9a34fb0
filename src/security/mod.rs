pub mod credentials;

// Re-export key types for convenience
pub use credentials::{CredentialStore, Credentials, LocalCredentialStore};
