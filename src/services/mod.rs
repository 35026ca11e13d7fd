//! Protocol services: one-time token stores, PKCE, and federation glue.

pub mod codes;
pub mod federation;
pub mod oauth_state;
pub mod pkce;
pub mod refresh;

pub use codes::{AuthCodeStore, AuthorizationCode, IssueCode};
pub use oauth_state::{OAuthState, OAuthStateStore};
pub use refresh::{IssueRefreshToken, RefreshToken, RefreshTokenStore};
