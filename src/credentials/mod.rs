// file: src/credentials/mod.rs
// description: storage provider credentials and the authorization flow
// reference: internal module structure

pub mod oauth;
pub mod pending;
pub mod store;

pub use oauth::{AuthorizationCode, GoogleOAuthClient, TokenGrant, TokenProvider};
pub use pending::{PendingAuthorization, PendingAuthorizations};
pub use store::CredentialStore;
