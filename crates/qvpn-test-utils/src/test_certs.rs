//! Generated certificates for tests.
//!
//! Builds a throwaway CA plus client/server leaf certificates so TLS code
//! paths can be exercised without fixture files.

use rcgen::{
    BasicConstraints, Certificate, CertificateParams, DnType, IsCa, KeyPair,
};

/// A generated certificate authority.
pub struct TestCa {
    pub cert: Certificate,
    pub key: KeyPair,
}

impl TestCa {
    /// Generate a fresh CA.
    pub fn generate() -> Self {
        let mut params =
            CertificateParams::new(Vec::new()).expect("empty SAN list is always valid");
        params
            .distinguished_name
            .push(DnType::CommonName, "qvpn test ca");
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);

        let key = KeyPair::generate().expect("keypair generation");
        let cert = params.self_signed(&key).expect("self-signed CA");
        Self { cert, key }
    }

    /// CA certificate in PEM form (the `ca_file` contents).
    pub fn ca_pem(&self) -> String {
        self.cert.pem()
    }

    /// Issue a client certificate whose subject CN is `common_name`.
    /// Returns (cert_pem, key_pem).
    pub fn issue_client(&self, common_name: &str) -> (String, String) {
        let mut params =
            CertificateParams::new(Vec::new()).expect("empty SAN list is always valid");
        params
            .distinguished_name
            .push(DnType::CommonName, common_name);

        let key = KeyPair::generate().expect("keypair generation");
        let cert = params
            .signed_by(&key, &self.cert, &self.key)
            .expect("client certificate signing");
        (cert.pem(), key.serialize_pem())
    }

    /// Issue a server certificate for `dns_name`.
    /// Returns (cert_pem, key_pem).
    pub fn issue_server(&self, dns_name: &str) -> (String, String) {
        let mut params = CertificateParams::new(vec![dns_name.to_string()])
            .expect("valid DNS name");
        params
            .distinguished_name
            .push(DnType::CommonName, dns_name);

        let key = KeyPair::generate().expect("keypair generation");
        let cert = params
            .signed_by(&key, &self.cert, &self.key)
            .expect("server certificate signing");
        (cert.pem(), key.serialize_pem())
    }

    /// Issue a client certificate and return its DER bytes, for code that
    /// inspects the certificate directly.
    pub fn issue_client_der(&self, common_name: &str) -> Vec<u8> {
        let mut params =
            CertificateParams::new(Vec::new()).expect("empty SAN list is always valid");
        params
            .distinguished_name
            .push(DnType::CommonName, common_name);

        let key = KeyPair::generate().expect("keypair generation");
        let cert = params
            .signed_by(&key, &self.cert, &self.key)
            .expect("client certificate signing");
        cert.der().to_vec()
    }
}
