use encryption::logic::CryptoService;
use identity::service::IdentityService;
use telemetry::LogStore;

use crate::repository::Repository;

/// Hub config manager: owns the repository, the cipher bound to the active
/// encryption key, and the HTTP client used for probes.
#[derive(Clone)]
pub struct HubService {
    pub repository: Repository,
    pub identity: IdentityService,
    pub logstore: LogStore<telemetry::repository::Repository>,
    pub crypto: CryptoService,
    pub http: reqwest::Client,
    pub forbid_loopback: bool,
}

impl HubService {
    pub fn new(
        repository: Repository,
        identity: IdentityService,
        logstore: LogStore<telemetry::repository::Repository>,
        crypto: CryptoService,
        http: reqwest::Client,
        forbid_loopback: bool,
    ) -> Self {
        Self {
            repository,
            identity,
            logstore,
            crypto,
            http,
            forbid_loopback,
        }
    }
}
