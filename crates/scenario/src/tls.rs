//! Custom CA material for driver deployments: a self-signed CA plus registry and
//! node-controller certificates signed by it, base64-encoded PEM as the CRD expects.

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use conv_core::{DeploymentSpec, HarnessError};
use rcgen::{
    BasicConstraints, CertificateParams, DistinguishedName, DnType, DnValue, IsCa, Issuer, KeyPair, KeyUsagePurpose,
};
use thiserror::Error;

pub const REGISTRY_COMMON_NAME: &str = "pmem-registry";
pub const NODE_CONTROLLER_COMMON_NAME: &str = "pmem-node-controller";

#[derive(Debug, Error)]
pub enum TlsError {
    #[error("key generation failed: {0}")]
    Key(String),
    #[error("certificate generation failed: {0}")]
    Certificate(String),
}

impl From<TlsError> for HarnessError {
    fn from(e: TlsError) -> Self { HarnessError::Invalid(e.to_string()) }
}

/// PEM-encoded CA plus leaf certificates and keys.
#[derive(Debug, Clone)]
pub struct TlsMaterial {
    pub ca_cert: String,
    pub registry_cert: String,
    pub registry_key: String,
    pub node_controller_cert: String,
    pub node_controller_key: String,
}

fn named(common_name: &str) -> DistinguishedName {
    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, DnValue::Utf8String(common_name.to_string()));
    dn
}

fn leaf(common_name: &str, issuer: &Issuer<'_, &KeyPair>) -> Result<(String, String), TlsError> {
    let mut params = CertificateParams::default();
    params.distinguished_name = named(common_name);
    params.is_ca = IsCa::NoCa;
    params.key_usages = vec![KeyUsagePurpose::DigitalSignature, KeyUsagePurpose::KeyEncipherment];
    let key = KeyPair::generate().map_err(|e| TlsError::Key(format!("{}: {}", common_name, e)))?;
    let cert = params
        .signed_by(&key, issuer)
        .map_err(|e| TlsError::Certificate(format!("{}: {}", common_name, e)))?;
    Ok((cert.pem(), key.serialize_pem()))
}

impl TlsMaterial {
    pub fn generate() -> Result<Self, TlsError> {
        let mut params = CertificateParams::default();
        params.distinguished_name = named("pmem-ca");
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params.key_usages = vec![KeyUsagePurpose::KeyCertSign, KeyUsagePurpose::CrlSign, KeyUsagePurpose::DigitalSignature];
        let ca_key = KeyPair::generate().map_err(|e| TlsError::Key(format!("ca: {}", e)))?;
        let ca_cert = params.self_signed(&ca_key).map_err(|e| TlsError::Certificate(format!("ca: {}", e)))?.pem();
        let issuer = Issuer::from_ca_cert_pem(&ca_cert, &ca_key).map_err(|e| TlsError::Certificate(format!("issuer: {}", e)))?;

        let (registry_cert, registry_key) = leaf(REGISTRY_COMMON_NAME, &issuer)?;
        let (node_controller_cert, node_controller_key) = leaf(NODE_CONTROLLER_COMMON_NAME, &issuer)?;
        Ok(Self { ca_cert, registry_cert, registry_key, node_controller_cert, node_controller_key })
    }

    /// Store the material in `spec`, replacing any previous certificates.
    pub fn apply(&self, spec: &mut DeploymentSpec) {
        let enc = |pem: &str| STANDARD.encode(pem.as_bytes());
        spec.ca_cert = Some(enc(&self.ca_cert));
        spec.registry_cert = Some(enc(&self.registry_cert));
        spec.registry_key = Some(enc(&self.registry_key));
        spec.node_controller_cert = Some(enc(&self.node_controller_cert));
        spec.node_controller_key = Some(enc(&self.node_controller_key));
    }
}

/// Generate fresh material and apply it to `spec`.
pub fn set_tls(spec: &mut DeploymentSpec) -> Result<(), HarnessError> {
    TlsMaterial::generate()?.apply(spec);
    Ok(())
}
