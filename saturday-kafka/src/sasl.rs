use std::fmt;

use rdkafka::ClientConfig;

use crate::config::Acl;
use crate::scram::{HashAlgorithm, ScramClient};

/// SASL/SCRAM credentials for one broker connection.
#[derive(Clone)]
pub struct ScramAuth {
    pub user: String,
    pub password: String,
    pub algorithm: HashAlgorithm,
}

impl ScramAuth {
    /// `None` when the ACL is disabled
    pub fn from_acl(acl: &Acl) -> Option<Self> {
        if !acl.enable {
            return None;
        }
        Some(Self { user: acl.user.clone(), password: acl.password.clone(), algorithm: acl.mechanism })
    }

    /// A fresh authenticator for a new connection
    #[inline]
    pub fn new_client(&self) -> ScramClient {
        ScramClient::new(self.algorithm)
    }

    // librdkafka runs the SCRAM exchange for these connections, `new_client` is for
    // transports that drive the handshake themselves.
    pub fn apply(&self, cfg: &mut ClientConfig) {
        cfg.set("security.protocol", "SASL_PLAINTEXT")
            .set("sasl.mechanism", self.algorithm.mechanism())
            .set("sasl.username", &self.user)
            .set("sasl.password", &self.password);
    }
}

impl fmt::Debug for ScramAuth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScramAuth").field("user", &self.user).field("algorithm", &self.algorithm).finish()
    }
}
