//! Short-lived client certificate issuer.
//!
//! The MITM authenticates against the database with certificates minted on
//! the fly: one per database user, valid for a single minute, signed by the
//! intermediate CA the database trusts for client auth. A bounded cache
//! avoids regenerating a key pair for every channel of a busy user.

use std::collections::HashMap;
use std::path::Path;

use chrono::{DateTime, Duration, Utc};
use parking_lot::RwLock;
use rand::RngCore;
use rcgen::{
    CertificateParams, DistinguishedName, DnType, ExtendedKeyUsagePurpose, KeyPair, SerialNumber,
    PKCS_RSA_SHA256,
};
use rsa::pkcs8::{EncodePrivateKey, LineEnding};
use rsa::RsaPrivateKey;
use rustls::pki_types::CertificateDer;

use crate::error::{ProxyError, Result};

const MAX_CACHE_SIZE: usize = 1000;
const CERT_TTL_SECS: i64 = 60;
const LEAF_KEY_BITS: usize = 4096;

/// An issued leaf certificate with its private key.
///
/// Valid for exactly one minute from issue; callers must not persist it
/// beyond the TLS handshake it was requested for.
#[derive(Clone)]
pub struct IssuedCert {
    pub cert_der: CertificateDer<'static>,
    pub key_der: Vec<u8>,
    pub not_after: DateTime<Utc>,
}

/// Issues one-minute client certificates signed by the configured CA.
pub struct CertIssuer {
    ca_cert: rcgen::Certificate,
    ca_key: KeyPair,
    key_bits: usize,
    max_cache_size: usize,
    cache: RwLock<HashMap<String, IssuedCert>>,
}

impl CertIssuer {
    /// Load the CA certificate and private key (PEM, PKCS#8 key).
    pub fn new(ca_cert_path: &Path, ca_key_path: &Path) -> Result<CertIssuer> {
        let ca_cert_pem = std::fs::read_to_string(ca_cert_path)?;
        let ca_key_pem = std::fs::read_to_string(ca_key_path)?;

        let ca_key = KeyPair::from_pem(&ca_key_pem)
            .map_err(|e| ProxyError::CertIssue(format!("parse CA private key: {e}")))?;
        let ca_params = CertificateParams::from_ca_cert_pem(&ca_cert_pem)
            .map_err(|e| ProxyError::CertIssue(format!("parse CA certificate: {e}")))?;
        let ca_cert = ca_params
            .self_signed(&ca_key)
            .map_err(|e| ProxyError::CertIssue(format!("rebuild CA certificate: {e}")))?;

        Ok(CertIssuer {
            ca_cert,
            ca_key,
            key_bits: LEAF_KEY_BITS,
            max_cache_size: MAX_CACHE_SIZE,
            cache: RwLock::new(HashMap::new()),
        })
    }

    /// Return a certificate for `common_name`, minting one when the cache
    /// has no entry that is still valid. RSA key generation is CPU-bound;
    /// async callers should wrap this in `spawn_blocking`.
    pub fn issue(&self, common_name: &str) -> Result<IssuedCert> {
        let now = Utc::now();

        {
            let cache = self.cache.read();
            if let Some(cert) = cache.get(common_name) {
                if now < cert.not_after {
                    return Ok(cert.clone());
                }
            }
        }

        let issued = self.generate(common_name, now)?;
        self.add_to_cache(common_name, issued.clone(), now);
        Ok(issued)
    }

    fn generate(&self, common_name: &str, now: DateTime<Utc>) -> Result<IssuedCert> {
        let not_after = now + Duration::seconds(CERT_TTL_SECS);

        let mut serial = [0u8; 17];
        rand::rngs::OsRng.fill_bytes(&mut serial);
        serial[0] &= 0x03; // 130 bits

        let mut params = CertificateParams::new(Vec::<String>::new())
            .map_err(|e| ProxyError::CertIssue(format!("certificate params: {e}")))?;
        let mut dn = DistinguishedName::new();
        dn.push(DnType::OrganizationName, "DBProxy");
        dn.push(DnType::CommonName, common_name);
        params.distinguished_name = dn;
        params.serial_number = Some(SerialNumber::from(serial.to_vec()));
        params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ClientAuth];
        params.not_before = time::OffsetDateTime::from_unix_timestamp(now.timestamp())
            .map_err(|e| ProxyError::CertIssue(format!("not_before: {e}")))?;
        params.not_after = time::OffsetDateTime::from_unix_timestamp(not_after.timestamp())
            .map_err(|e| ProxyError::CertIssue(format!("not_after: {e}")))?;

        let rsa_key = RsaPrivateKey::new(&mut rand::rngs::OsRng, self.key_bits)
            .map_err(|e| ProxyError::CertIssue(format!("generate RSA key: {e}")))?;
        let key_pem = rsa_key
            .to_pkcs8_pem(LineEnding::LF)
            .map_err(|e| ProxyError::CertIssue(format!("encode RSA key: {e}")))?;
        let key_pair = KeyPair::from_pem_and_sign_algo(&key_pem, &PKCS_RSA_SHA256)
            .map_err(|e| ProxyError::CertIssue(format!("load RSA key: {e}")))?;

        let cert = params
            .signed_by(&key_pair, &self.ca_cert, &self.ca_key)
            .map_err(|e| ProxyError::CertIssue(format!("sign certificate: {e}")))?;

        Ok(IssuedCert {
            cert_der: cert.der().clone(),
            key_der: key_pair.serialize_der(),
            not_after,
        })
    }

    /// Insert honoring the bounded-cache policy: when the insert would grow
    /// a full cache, evict every expired entry first. The insert itself
    /// always succeeds, so the size may transiently exceed the bound until
    /// expirations accumulate.
    fn add_to_cache(&self, common_name: &str, cert: IssuedCert, now: DateTime<Utc>) {
        let mut cache = self.cache.write();
        if !cache.contains_key(common_name) && cache.len() + 1 >= self.max_cache_size {
            cache.retain(|_, entry| now < entry.not_after);
        }
        cache.insert(common_name.to_string(), cert);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_ca() -> (tempfile::NamedTempFile, tempfile::NamedTempFile) {
        let ca_key = KeyPair::generate().expect("generate CA key");
        let mut params = CertificateParams::new(Vec::<String>::new()).expect("params");
        params.is_ca = rcgen::IsCa::Ca(rcgen::BasicConstraints::Unconstrained);
        params
            .distinguished_name
            .push(DnType::CommonName, "Test Issuing CA");
        let ca_cert = params.self_signed(&ca_key).expect("self sign");

        let cert_file = tempfile::NamedTempFile::new().unwrap();
        std::fs::write(cert_file.path(), ca_cert.pem()).unwrap();
        let key_file = tempfile::NamedTempFile::new().unwrap();
        std::fs::write(key_file.path(), ca_key.serialize_pem()).unwrap();
        (cert_file, key_file)
    }

    fn test_issuer() -> CertIssuer {
        let (cert_file, key_file) = test_ca();
        let mut issuer = CertIssuer::new(cert_file.path(), key_file.path()).expect("issuer");
        // 4096-bit generation is too slow for unit tests.
        issuer.key_bits = 2048;
        issuer
    }

    fn synthetic(not_after: DateTime<Utc>) -> IssuedCert {
        IssuedCert {
            cert_der: CertificateDer::from(vec![0u8; 8]),
            key_der: vec![0u8; 8],
            not_after,
        }
    }

    #[test]
    fn issue_and_cache() {
        let issuer = test_issuer();

        let before = Utc::now();
        let first = issuer.issue("alice").expect("issue");
        assert!(!first.cert_der.as_ref().is_empty());
        assert!(!first.key_der.is_empty());
        assert!(first.not_after > before);
        assert!(first.not_after <= before + Duration::seconds(CERT_TTL_SECS + 2));

        // Second request within the validity window is served from cache.
        let second = issuer.issue("alice").expect("issue");
        assert_eq!(first.cert_der.as_ref(), second.cert_der.as_ref());

        // A different subject gets a different certificate.
        let other = issuer.issue("bob").expect("issue");
        assert_ne!(first.cert_der.as_ref(), other.cert_der.as_ref());
    }

    #[test]
    fn expired_cache_entry_is_not_returned() {
        let issuer = test_issuer();
        issuer
            .cache
            .write()
            .insert("carol".into(), synthetic(Utc::now() - Duration::seconds(1)));

        let issued = issuer.issue("carol").expect("issue");
        assert_ne!(issued.cert_der.as_ref(), &[0u8; 8]);
        assert!(Utc::now() < issued.not_after);
    }

    #[test]
    fn full_cache_evicts_expired_entries() {
        let mut issuer = test_issuer();
        issuer.max_cache_size = 4;
        let now = Utc::now();
        {
            let mut cache = issuer.cache.write();
            cache.insert("old1".into(), synthetic(now - Duration::seconds(5)));
            cache.insert("old2".into(), synthetic(now - Duration::seconds(5)));
            cache.insert("live".into(), synthetic(now + Duration::seconds(60)));
        }

        issuer.add_to_cache("fresh", synthetic(now + Duration::seconds(60)), now);
        let cache = issuer.cache.read();
        assert!(cache.contains_key("fresh"));
        assert!(cache.contains_key("live"));
        assert!(!cache.contains_key("old1"));
        assert!(!cache.contains_key("old2"));
    }

    #[test]
    fn full_cache_of_live_entries_still_inserts() {
        let mut issuer = test_issuer();
        issuer.max_cache_size = 3;
        let now = Utc::now();
        {
            let mut cache = issuer.cache.write();
            cache.insert("a".into(), synthetic(now + Duration::seconds(60)));
            cache.insert("b".into(), synthetic(now + Duration::seconds(60)));
        }
        issuer.add_to_cache("c", synthetic(now + Duration::seconds(60)), now);
        assert_eq!(issuer.cache.read().len(), 3);
    }
}
