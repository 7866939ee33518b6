//! Secure-channel upgrade contract.
//!
//! The engine hands the raw stream to a [`SecureChannel`] after the
//! STARTTLS exchange and continues on the stream it returns. Which TLS
//! stack sits behind the trait is up to the application; the engine only
//! asks a [`CertificatePolicy`] whether the presented peer chain binds to
//! the expected node.

use async_trait::async_trait;

use crate::error::{Result, TransportError};
use crate::protocol::NodeId;
use crate::transport::BoxedStream;

/// Common-name prefix every node certificate carries.
pub const NODE_CERT_SUBJECT_PREFIX: &str = "Robot Raconteur Node ";

/// SHA-256 fingerprint of a certificate.
pub type Fingerprint = [u8; 32];

/// One certificate of a presented chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CertificateInfo {
    pub subject_common_name: String,
    pub fingerprint: Fingerprint,
    /// Certificate policy OIDs found in the certificate.
    pub policy_oids: Vec<String>,
}

/// Chain presented by the peer, leaf first.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct PeerCertificate {
    pub chain: Vec<CertificateInfo>,
}

impl PeerCertificate {
    pub fn leaf(&self) -> Option<&CertificateInfo> {
        self.chain.first()
    }

    pub fn root(&self) -> Option<&CertificateInfo> {
        self.chain.last()
    }
}

/// Stream produced by a completed upgrade.
pub struct SecureStream {
    pub stream: BoxedStream,
    /// Peer chain, if the peer presented one.
    pub peer: Option<PeerCertificate>,
}

/// Pluggable TLS implementation.
#[async_trait]
pub trait SecureChannel: Send + Sync + 'static {
    /// Initiator side of the handshake.
    async fn connect(&self, stream: BoxedStream, remote: NodeId) -> Result<SecureStream>;

    /// Responder side of the handshake.
    async fn accept(&self, stream: BoxedStream) -> Result<SecureStream>;
}

/// Decides whether a peer chain proves the identity of `expected`.
pub trait CertificatePolicy: Send + Sync + 'static {
    /// Returns the node id the chain is bound to. `expected` may be
    /// [`NodeId::ANY`], in which case the id is taken from the leaf subject.
    fn verify(&self, expected: NodeId, peer: &PeerCertificate) -> Result<NodeId>;
}

/// Role-specific OIDs for chains not anchored by a known root.
///
/// Disabled by default. The individual role checks exist but their final
/// form was never settled, so the whole policy stays opt-in.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OidPolicy {
    pub enabled: bool,
    pub leaf_oid: Option<String>,
    pub intermediate_oid: Option<String>,
    pub root_oid: Option<String>,
}

impl OidPolicy {
    /// Whether every certificate in the chain carries its role OID.
    pub fn accepts(&self, peer: &PeerCertificate) -> bool {
        if !self.enabled || peer.chain.len() < 2 {
            return false;
        }
        let last = peer.chain.len() - 1;
        peer.chain.iter().enumerate().all(|(i, cert)| {
            let required = match i {
                0 => &self.leaf_oid,
                i if i == last => &self.root_oid,
                _ => &self.intermediate_oid,
            };
            match required {
                Some(oid) => cert.policy_oids.iter().any(|o| o == oid),
                None => true,
            }
        })
    }
}

/// Default node certificate policy: subject binding plus trust anchors.
#[derive(Debug, Clone, Default)]
pub struct NodeCertificatePolicy {
    trust_anchors: Vec<Fingerprint>,
    oid_policy: OidPolicy,
}

impl NodeCertificatePolicy {
    /// Policy anchored by the given root fingerprints.
    pub fn new(trust_anchors: impl IntoIterator<Item = Fingerprint>) -> Self {
        Self {
            trust_anchors: trust_anchors.into_iter().collect(),
            oid_policy: OidPolicy::default(),
        }
    }

    pub fn with_oid_policy(mut self, oid_policy: OidPolicy) -> Self {
        self.oid_policy = oid_policy;
        self
    }

    pub fn trust_anchors(&self) -> &[Fingerprint] {
        &self.trust_anchors
    }
}

/// Subject common name a node certificate must carry.
pub fn node_subject(node: &NodeId) -> String {
    format!("{}{}", NODE_CERT_SUBJECT_PREFIX, node)
}

impl CertificatePolicy for NodeCertificatePolicy {
    fn verify(&self, expected: NodeId, peer: &PeerCertificate) -> Result<NodeId> {
        let leaf = peer
            .leaf()
            .ok_or_else(|| TransportError::IdentityMismatch("Peer presented no certificate".into()))?;

        let bound = leaf
            .subject_common_name
            .strip_prefix(NODE_CERT_SUBJECT_PREFIX)
            .and_then(|id| id.parse::<NodeId>().ok())
            .ok_or_else(|| {
                TransportError::IdentityMismatch(format!(
                    "Certificate subject '{}' is not a node certificate",
                    leaf.subject_common_name
                ))
            })?;

        if !expected.is_any_node() && bound != expected {
            return Err(TransportError::IdentityMismatch(format!(
                "Certificate is bound to {}, expected {}",
                bound, expected
            )));
        }

        let anchored = peer
            .root()
            .map(|root| self.trust_anchors.contains(&root.fingerprint))
            .unwrap_or(false);
        if !anchored && !self.oid_policy.accepts(peer) {
            return Err(TransportError::IdentityMismatch(
                "Certificate chain is not anchored by a trusted root".into(),
            ));
        }
        Ok(bound)
    }
}
