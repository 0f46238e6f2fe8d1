use super::{CredentialVerifier, VerifierError};
use crate::types::ActorId;
use async_trait::async_trait;
use parking_lot::RwLock;
use sha2::{Digest, Sha256};
use std::collections::HashMap;

/// Password store keeping only SHA-256 digests
#[derive(Debug, Default)]
pub struct InMemoryCredentials {
    digests: RwLock<HashMap<ActorId, [u8; 32]>>,
}

impl InMemoryCredentials {
    /// Empty credential store
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set or replace the password of `actor_id`
    pub fn set_password(&self, actor_id: ActorId, password: &str) {
        self.digests.write().insert(actor_id, digest(password));
    }

    /// Forget an actor; later verifications fail
    pub fn revoke(&self, actor_id: ActorId) {
        self.digests.write().remove(&actor_id);
    }
}

fn digest(secret: &str) -> [u8; 32] {
    Sha256::digest(secret.as_bytes()).into()
}

#[async_trait]
impl CredentialVerifier for InMemoryCredentials {
    async fn verify(&self, actor_id: ActorId, secret: &str) -> Result<bool, VerifierError> {
        let candidate = digest(secret);
        Ok(self
            .digests
            .read()
            .get(&actor_id)
            .is_some_and(|stored| *stored == candidate))
    }
}
