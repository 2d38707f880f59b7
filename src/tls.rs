//! TLS adapter: wraps the byte stream immediately after connect/accept.
//! Certificates and keys arrive as PEM byte blobs supplied by the host
//! application; there is no keychain or certificate-store integration here.

use openssl::pkey::PKey;
use openssl::ssl::{SslAcceptor, SslConnector, SslMethod, SslVerifyMode};
use openssl::x509::X509;

use crate::error::Error;

/// Client-side trust policy.
#[derive(Debug, Clone, Default)]
pub struct TlsClientPolicy {
    /// PEM-encoded CA certificates the viewer's certificate must chain to.
    /// When absent, the connection is anonymous: any certificate (typically
    /// the viewer's self-signed one) is accepted.
    pub pinned_roots_pem: Option<Vec<u8>>,
}

impl TlsClientPolicy {
    pub fn anonymous() -> TlsClientPolicy {
        TlsClientPolicy::default()
    }

    pub fn pinned(roots_pem: Vec<u8>) -> TlsClientPolicy {
        TlsClientPolicy {
            pinned_roots_pem: Some(roots_pem),
        }
    }

    pub fn is_anonymous(&self) -> bool {
        self.pinned_roots_pem.is_none()
    }
}

/// Viewer-side certificate chain and private key.
#[derive(Debug, Clone)]
pub struct TlsServerIdentity {
    /// Leaf certificate first, then any intermediates, PEM-encoded.
    pub cert_chain_pem: Vec<u8>,
    pub private_key_pem: Vec<u8>,
}

/// Builds the client connector for the given policy. Errors are
/// configuration errors and surface synchronously at startup.
pub fn build_connector(policy: &TlsClientPolicy) -> Result<SslConnector, Error> {
    let mut builder = SslConnector::builder(SslMethod::tls())?;
    match policy.pinned_roots_pem {
        Some(ref pem) => {
            let roots = X509::stack_from_pem(pem)?;
            if roots.is_empty() {
                return Err(Error::Configuration(String::from(
                    "pinned CA bundle contains no certificates",
                )));
            }
            for root in roots {
                builder.cert_store_mut().add_cert(root)?;
            }
        }
        None => builder.set_verify(SslVerifyMode::NONE),
    }
    Ok(builder.build())
}

/// Builds the viewer acceptor from a PEM chain + key.
pub fn build_acceptor(identity: &TlsServerIdentity) -> Result<SslAcceptor, Error> {
    let mut chain = X509::stack_from_pem(&identity.cert_chain_pem)?.into_iter();
    let leaf = chain.next().ok_or_else(|| {
        Error::Configuration(String::from("certificate chain contains no certificates"))
    })?;
    let key = PKey::private_key_from_pem(&identity.private_key_pem)?;

    let mut builder = SslAcceptor::mozilla_intermediate(SslMethod::tls())?;
    builder.set_private_key(&key)?;
    builder.set_certificate(&leaf)?;
    for intermediate in chain {
        builder.add_extra_chain_cert(intermediate)?;
    }
    builder.check_private_key()?;
    Ok(builder.build())
}

#[cfg(test)]
pub(crate) fn self_signed_identity(common_name: &str) -> TlsServerIdentity {
    use openssl::asn1::Asn1Time;
    use openssl::bn::{BigNum, MsbOption};
    use openssl::hash::MessageDigest;
    use openssl::rsa::Rsa;
    use openssl::x509::extension::SubjectAlternativeName;
    use openssl::x509::{X509Builder, X509NameBuilder};

    let rsa = Rsa::generate(2048).unwrap();
    let key = PKey::from_rsa(rsa).unwrap();

    let mut name = X509NameBuilder::new().unwrap();
    name.append_entry_by_text("CN", common_name).unwrap();
    let name = name.build();

    let mut builder = X509Builder::new().unwrap();
    builder.set_version(2).unwrap();
    let mut serial = BigNum::new().unwrap();
    serial.rand(64, MsbOption::MAYBE_ZERO, false).unwrap();
    builder
        .set_serial_number(&serial.to_asn1_integer().unwrap())
        .unwrap();
    builder.set_subject_name(&name).unwrap();
    builder.set_issuer_name(&name).unwrap();
    builder.set_pubkey(&key).unwrap();
    builder
        .set_not_before(&Asn1Time::days_from_now(0).unwrap())
        .unwrap();
    builder
        .set_not_after(&Asn1Time::days_from_now(1).unwrap())
        .unwrap();
    let san = SubjectAlternativeName::new()
        .dns(common_name)
        .build(&builder.x509v3_context(None, None))
        .unwrap();
    builder.append_extension(san).unwrap();
    builder.sign(&key, MessageDigest::sha256()).unwrap();
    let cert = builder.build();

    TlsServerIdentity {
        cert_chain_pem: cert.to_pem().unwrap(),
        private_key_pem: key.private_key_to_pem_pkcs8().unwrap(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn acceptor_from_self_signed_identity() {
        let identity = self_signed_identity("nslogger-test");
        build_acceptor(&identity).unwrap();
    }

    #[test]
    fn connector_pins_roots() {
        let identity = self_signed_identity("nslogger-test");
        build_connector(&TlsClientPolicy::pinned(identity.cert_chain_pem)).unwrap();
        build_connector(&TlsClientPolicy::anonymous()).unwrap();
    }

    #[test]
    fn bad_pem_is_a_configuration_error() {
        let bogus = TlsServerIdentity {
            cert_chain_pem: b"not pem".to_vec(),
            private_key_pem: b"not pem".to_vec(),
        };
        assert!(build_acceptor(&bogus).is_err());

        assert!(matches!(
            build_connector(&TlsClientPolicy::pinned(b"".to_vec())),
            Err(Error::Configuration(_))
        ));
    }
}
