use crate::error::Result;
use crate::listeners::Subscription;
use crate::provider::{IdentityProvider, ProviderListener};
use crate::types::{
    AuthenticatedSession, Session, SignOutScope, SignUpOutcome, User, UserAttributes,
    UserMetadata,
};
use async_trait::async_trait;
use mockall::mock;

mock! {
    pub Provider {}

    #[async_trait]
    impl IdentityProvider for Provider {
        async fn get_session(&self) -> Result<Option<Session>>;
        async fn get_user(&self, access_token: &str) -> Result<User>;
        async fn exchange_code(&self, code: &str) -> Result<AuthenticatedSession>;
        async fn set_session(&self, access_token: &str, refresh_token: &str) -> Result<Session>;
        async fn refresh_session(&self, refresh_token: &str) -> Result<AuthenticatedSession>;
        async fn sign_in_with_password(&self, email: &str, password: &str) -> Result<AuthenticatedSession>;
        async fn sign_up(&self, email: &str, password: &str, profile: UserMetadata) -> Result<SignUpOutcome>;
        async fn sign_out(&self, scope: SignOutScope) -> Result<()>;
        async fn reset_password_for_email(&self, email: &str, redirect_to: Option<String>) -> Result<()>;
        async fn update_user(&self, access_token: &str, attributes: UserAttributes) -> Result<User>;
        async fn discard_session(&self);
        fn subscribe(&self, listener: ProviderListener) -> Subscription;
    }
}
