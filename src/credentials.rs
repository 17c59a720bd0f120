use std::fmt;
use std::path::PathBuf;

use openssl::pkcs12::Pkcs12;
use openssl::pkey::{PKey, Private};
use openssl::x509::X509;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("can not read key store {path}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("can not open key store (wrong passphrase or malformed PKCS #12)")]
    OpenSsl(#[from] openssl::error::ErrorStack),
    #[error("key store holds no private key")]
    MissingKey,
    #[error("key store holds no certificate")]
    MissingCertificate,
}

enum Source {
    File(PathBuf),
    Bytes(Vec<u8>),
}

/// A PKCS #12 key store and the passphrase protecting it.
///
/// Nothing is parsed up front: every call to
/// [`KeyStore::private_key_entry`] reads and decrypts the store again.
pub struct KeyStore {
    source: Source,
    passphrase: String,
}

/// Private key with the certificate it belongs to and the rest of the chain.
pub struct PrivateKeyEntry {
    pub key: PKey<Private>,
    pub certificate: X509,
    pub chain: Vec<X509>,
}

impl KeyStore {
    pub fn from_file(path: impl Into<PathBuf>, passphrase: impl Into<String>) -> Self {
        Self {
            source: Source::File(path.into()),
            passphrase: passphrase.into(),
        }
    }

    pub fn from_bytes(der: impl Into<Vec<u8>>, passphrase: impl Into<String>) -> Self {
        Self {
            source: Source::Bytes(der.into()),
            passphrase: passphrase.into(),
        }
    }

    pub fn private_key_entry(&self) -> Result<PrivateKeyEntry, Error> {
        let read;
        let der = match &self.source {
            Source::File(path) => {
                read = std::fs::read(path).map_err(|source| Error::Io {
                    path: path.clone(),
                    source,
                })?;
                &read
            }
            Source::Bytes(bytes) => bytes,
        };

        let parsed = Pkcs12::from_der(der)?.parse2(&self.passphrase)?;
        let key = parsed.pkey.ok_or(Error::MissingKey)?;
        let certificate = parsed.cert.ok_or(Error::MissingCertificate)?;
        let chain = parsed
            .ca
            .map(|stack| stack.into_iter().collect())
            .unwrap_or_default();

        Ok(PrivateKeyEntry {
            key,
            certificate,
            chain,
        })
    }
}

impl fmt::Debug for KeyStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let source = match &self.source {
            Source::File(path) => path.display().to_string(),
            Source::Bytes(bytes) => format!("<{} bytes>", bytes.len()),
        };
        f.debug_struct("KeyStore")
            .field("source", &source)
            .field("passphrase", &"***")
            .finish()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use openssl::asn1::Asn1Time;
    use openssl::bn::BigNum;
    use openssl::hash::MessageDigest;
    use openssl::nid::Nid;
    use openssl::rsa::Rsa;
    use openssl::x509::X509NameBuilder;

    /// Builds a self-signed certificate and returns it as a PKCS #12 store.
    pub(crate) fn self_signed_p12(common_name: &str, passphrase: &str) -> Vec<u8> {
        let key = PKey::from_rsa(Rsa::generate(2048).unwrap()).unwrap();

        let mut name = X509NameBuilder::new().unwrap();
        name.append_entry_by_nid(Nid::COMMONNAME, common_name)
            .unwrap();
        let name = name.build();

        let mut builder = X509::builder().unwrap();
        builder.set_version(2).unwrap();
        let serial = BigNum::from_u32(1).unwrap().to_asn1_integer().unwrap();
        builder.set_serial_number(&serial).unwrap();
        builder.set_subject_name(&name).unwrap();
        builder.set_issuer_name(&name).unwrap();
        builder.set_pubkey(&key).unwrap();
        builder
            .set_not_before(&Asn1Time::days_from_now(0).unwrap())
            .unwrap();
        builder
            .set_not_after(&Asn1Time::days_from_now(365).unwrap())
            .unwrap();
        builder.sign(&key, MessageDigest::sha256()).unwrap();
        let cert = builder.build();

        Pkcs12::builder()
            .name(common_name)
            .pkey(&key)
            .cert(&cert)
            .build2(passphrase)
            .unwrap()
            .to_der()
            .unwrap()
    }

    #[test]
    fn opens_store_with_right_passphrase() {
        let store = KeyStore::from_bytes(self_signed_p12("Example Signer", "test"), "test");
        let entry = store.private_key_entry().unwrap();
        let cn = entry
            .certificate
            .subject_name()
            .entries_by_nid(Nid::COMMONNAME)
            .next()
            .unwrap()
            .data()
            .as_utf8()
            .unwrap()
            .to_string();
        assert_eq!(cn, "Example Signer");
        assert!(entry.chain.is_empty());
    }

    #[test]
    fn wrong_passphrase_is_an_error() {
        let store = KeyStore::from_bytes(self_signed_p12("Example Signer", "test"), "nope");
        assert!(matches!(store.private_key_entry(), Err(Error::OpenSsl(_))));
    }

    #[test]
    fn missing_file_is_an_io_error() {
        let store = KeyStore::from_file("/nonexistent/ExampleSigner.p12", "test");
        assert!(matches!(store.private_key_entry(), Err(Error::Io { .. })));
        assert!(!format!("{store:?}").contains("test"));
    }
}
