use std::path::Path;

use openssl::nid::Nid;
use openssl::pkcs7::{Pkcs7, Pkcs7Flags};
use openssl::stack::Stack;
use openssl::x509::store::{X509Store, X509StoreBuilder};
use openssl::x509::{X509NameRef, X509};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("openssl error")]
    OpenSsl(#[from] openssl::error::ErrorStack),
    #[error("can not read trusted CA directory")]
    Io(#[from] std::io::Error),
    #[error("signature carries no signer certificate")]
    NoSigner,
    #[error("certificate subject needs exactly one common name")]
    CommonName,
}

/// Which signer certificates are accepted.
pub enum TrustPolicy {
    /// The signer must chain up to one of these certificates.
    Anchors(X509Store),
    /// Any signer; only the signature value itself is checked.
    SignatureOnly,
}

impl TrustPolicy {
    /// Anchors from every PEM file in `dir`, or signature-only without one.
    pub fn from_dir(dir: Option<&Path>) -> Result<Self, Error> {
        let Some(dir) = dir else {
            return Ok(Self::SignatureOnly);
        };

        let mut store = X509StoreBuilder::new()?;
        for entry in std::fs::read_dir(dir)? {
            let pem = std::fs::read(entry?.path())?;
            for cert in X509::stack_from_pem(&pem)? {
                store.add_cert(cert)?;
            }
        }
        Ok(Self::Anchors(store.build()))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignerInfo {
    pub name: String,
}

/// The DER blob of a `/Contents` entry. CMS and PKCS #7 signed-data share
/// the same encoding, so both subfilters parse here.
pub struct DetachedSignature(Pkcs7);

impl DetachedSignature {
    pub fn from_der(der: &[u8]) -> Result<Self, Error> {
        Ok(Self(Pkcs7::from_der(der)?))
    }

    pub fn signers(&self) -> Result<Vec<SignerInfo>, Error> {
        let extra_certs = Stack::<X509>::new()?;
        let certs = self.0.signers(&extra_certs, Pkcs7Flags::empty())?;
        if certs.is_empty() {
            return Err(Error::NoSigner);
        }
        certs
            .iter()
            .map(|cert| {
                Ok(SignerInfo {
                    name: common_name(cert.subject_name())?,
                })
            })
            .collect()
    }

    /// Checks that the signature covers exactly `content`.
    pub fn check(&self, content: &[u8], trust: &TrustPolicy) -> Result<(), Error> {
        let no_extra_certs = Stack::new()?;
        let empty_store;
        let (store, flags) = match trust {
            TrustPolicy::Anchors(store) => (store, Pkcs7Flags::BINARY),
            TrustPolicy::SignatureOnly => {
                empty_store = X509StoreBuilder::new()?.build();
                (&empty_store, Pkcs7Flags::BINARY | Pkcs7Flags::NOVERIFY)
            }
        };

        self.0
            .verify(&no_extra_certs, store, Some(content), None, flags)?;
        Ok(())
    }
}

pub(crate) fn common_name(subject: &X509NameRef) -> Result<String, Error> {
    let mut names = subject.entries_by_nid(Nid::COMMONNAME);
    match (names.next(), names.next()) {
        (Some(cn), None) => Ok(cn.data().as_utf8()?.to_string()),
        _ => Err(Error::CommonName),
    }
}
