use attache_core::Destination;
use attache_crypto::{DecryptionKeys, SignaturePrefix};
use serde::{Deserialize, Serialize};

/// Everything a recipient needs to fetch and open an uploaded attachment.
/// Carries the symmetric key: treat a serialized descriptor as a secret.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObjectDescriptor {
    pub dest: Destination,
    pub plaintext_size: u64,
    pub sealed_size: u64,
    /// Hex SHA-256 of the plaintext
    pub content_hash: String,
    pub keys: DecryptionKeys,
    pub signature_prefix: SignaturePrefix,
}
