mod token_store;

pub use token_store::{OAuthState, TokenStore, TokenStoreError};
pub(crate) use token_store::now_unix;
