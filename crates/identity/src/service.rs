use encryption::logic::jwt::JwtSigner;
use telemetry::LogStore;

use crate::logic::auth_client::AuthClient;
use crate::repository::Repository;

/// Long-lived identity service handed to the routers and the dispatcher.
/// Owned by the composition root; everything inside is cheap to clone.
#[derive(Clone)]
pub struct IdentityService {
    pub repository: Repository,
    pub auth: AuthClient<Repository>,
    pub logstore: LogStore<telemetry::repository::Repository>,
    pub refresh_ttl_secs: u64,
}

impl IdentityService {
    pub fn new(
        repository: Repository,
        jwt_signer: JwtSigner,
        logstore: LogStore<telemetry::repository::Repository>,
        refresh_ttl_secs: u64,
    ) -> Self {
        Self {
            auth: AuthClient::new(repository.clone(), jwt_signer),
            repository,
            logstore,
            refresh_ttl_secs,
        }
    }
}
