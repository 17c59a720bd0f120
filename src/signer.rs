use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use lopdf::{
    dictionary, Dictionary, Document, IncrementalDocument, Object, ObjectId, Stream, StringFormat,
};
use openssl::cms::{CMSOptions, CmsContentInfo};
use openssl::pkcs7::{Pkcs7, Pkcs7Flags};
use openssl::stack::Stack;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::config::SuiteConfig;
use crate::credentials::{self, KeyStore, PrivateKeyEntry};
use crate::runner::{SignedDocument, SigningService};
use crate::stamp::{self, StampImage};
use crate::verify::pdf_ends_with_eof;
use crate::ExactArrayOrNone;

#[derive(Error, Debug)]
pub enum Error {
    #[error("io error")]
    Io(#[from] std::io::Error),
    #[error("PDF parsing error")]
    Parsing(#[from] lopdf::Error),
    #[error("can not load the signing credentials")]
    Credentials(#[from] credentials::Error),
    #[error("can not load the stamp image")]
    Stamp(#[from] stamp::Error),
    #[error("openssl error")]
    OpenSsl(#[from] openssl::error::ErrorStack),
    #[error("source document does not end like a PDF file")]
    InvalidSourceDocument,
    #[error("source document has no interactive form")]
    NoAcroForm,
    #[error("source document has no empty signature field")]
    NoEmptySignatureField,
    #[error("signature field has no widget rectangle")]
    FieldWithoutWidget,
    #[error("signature placeholder missing from the written update")]
    PlaceholderNotFound,
    #[error("signature needs {needed} bytes, but only {reserved} are reserved")]
    ReservedSpaceTooSmall { needed: usize, reserved: usize },
}

pub type Result<T> = std::result::Result<T, Error>;

/// Which kind of detached signature is embedded.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SignatureType {
    /// CMS signed-data, `/SubFilter /ETSI.CAdES.detached`.
    #[default]
    Cades,
    /// PKCS #7 signed-data, `/SubFilter /adbe.pkcs7.detached`.
    Pkcs7,
}

impl SignatureType {
    fn sub_filter(self) -> &'static [u8] {
        match self {
            SignatureType::Cades => b"ETSI.CAdES.detached",
            SignatureType::Pkcs7 => b"adbe.pkcs7.detached",
        }
    }
}

/// Everything the signer needs besides the stamp.
#[derive(Debug)]
pub struct SignerSettings {
    /// The unsigned sample document.
    pub document: PathBuf,
    /// Artifacts are resolved relative to this directory.
    pub assets_root: PathBuf,
    pub keystore: KeyStore,
    pub signature_type: SignatureType,
    /// Fixed output path, cleared before every signing attempt.
    pub output: PathBuf,
    /// Bytes reserved for the DER signature inside `/Contents`.
    pub contents_reserve: usize,
}

/// Signs the sample document once per stamp, always into the same output
/// file.
#[derive(Debug, Clone)]
pub struct PdfSigner {
    settings: Arc<SignerSettings>,
}

impl PdfSigner {
    pub fn new(settings: SignerSettings) -> Self {
        Self {
            settings: Arc::new(settings),
        }
    }

    pub fn from_config(config: &SuiteConfig) -> Self {
        let signing = &config.signing;
        Self::new(SignerSettings {
            document: PathBuf::from(&signing.document),
            assets_root: PathBuf::from(&config.assets.base_dir),
            keystore: KeyStore::from_file(&signing.keystore, signing.passphrase.clone()),
            signature_type: signing.signature_type,
            output: PathBuf::from(&signing.output),
            contents_reserve: signing.contents_reserve,
        })
    }
}

impl SignerSettings {
    fn sign_blocking(&self, artifact: &str) -> Result<PathBuf> {
        // Never let a stale file from a previous attempt pass for a result.
        match std::fs::remove_file(&self.output) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }

        let source = std::fs::read(&self.document)?;
        let entry = self.keystore.private_key_entry()?;
        let stamp = StampImage::load(self.assets_root.join(artifact))?;

        let signed = sign_document(
            &source,
            &stamp,
            &entry,
            self.signature_type,
            self.contents_reserve,
        )?;
        std::fs::write(&self.output, signed)?;

        Ok(self.output.clone())
    }
}

#[async_trait]
impl SigningService for PdfSigner {
    async fn sign(&self, artifact: &str) -> anyhow::Result<SignedDocument> {
        let settings = Arc::clone(&self.settings);
        let stamp = artifact.to_owned();
        let path = tokio::task::spawn_blocking(move || settings.sign_blocking(&stamp)).await??;

        Ok(SignedDocument {
            artifact: artifact.to_owned(),
            path,
        })
    }
}

/// Value of the three `/ByteRange` entries until the final layout is known.
/// Ten digits, so the patched offsets fit in the same width.
const BYTE_RANGE_PLACEHOLDER: i64 = 9_999_999_999;

/// Fills the first empty signature field of `source` and returns the signed
/// file.
pub fn sign_document(
    source: &[u8],
    stamp: &StampImage,
    entry: &PrivateKeyEntry,
    signature_type: SignatureType,
    contents_reserve: usize,
) -> Result<Vec<u8>> {
    if !pdf_ends_with_eof(source) {
        return Err(Error::InvalidSourceDocument);
    }
    let mut update = IncrementalDocument::create_from(source.to_vec(), Document::load_mem(source)?);

    let prev = update.get_prev_documents();
    let catalog_id = prev.trailer.get(b"Root")?.as_reference()?;
    let catalog = prev.get_dictionary(catalog_id)?.clone();
    let (acro_form_id, mut acro_form) = match catalog.get(b"AcroForm") {
        Ok(Object::Reference(id)) => (Some(*id), prev.get_dictionary(*id)?.clone()),
        Ok(Object::Dictionary(dict)) => (None, dict.clone()),
        _ => return Err(Error::NoAcroForm),
    };
    let (field_id, mut field) = first_empty_signature_field(prev, &acro_form)?;
    let rect = widget_rect(prev, &field)?;
    let version = prev.version.clone();
    debug!(?field_id, ?rect, "filling signature field");

    let doc = &mut update.new_document;
    doc.version = version;

    let mut image = stamp.image.clone();
    if let Some(mask) = &stamp.soft_mask {
        let mask_id = doc.add_object(mask.clone());
        image.dict.set("SMask", mask_id);
    }
    let image_id = doc.add_object(image);
    let appearance_id = doc.add_object(appearance_stream(rect, stamp, image_id));

    let mut signature = dictionary! {
        "Type" => "Sig",
        "Filter" => "Adobe.PPKLite",
        "SubFilter" => Object::Name(signature_type.sub_filter().to_vec()),
    };
    if let Some(name) = signer_common_name(entry) {
        signature.set("Name", Object::string_literal(name));
    }
    signature.set(
        "ByteRange",
        vec![
            Object::Integer(0),
            Object::Integer(BYTE_RANGE_PLACEHOLDER),
            Object::Integer(BYTE_RANGE_PLACEHOLDER),
            Object::Integer(BYTE_RANGE_PLACEHOLDER),
        ],
    );
    signature.set(
        "Contents",
        Object::String(vec![0; contents_reserve], StringFormat::Hexadecimal),
    );
    let signature_id = doc.add_object(signature);

    field.set("V", signature_id);
    field.set("AP", dictionary! { "N" => appearance_id });
    doc.set_object(field_id, field);

    acro_form.set("SigFlags", Object::Integer(3));
    match acro_form_id {
        Some(id) => doc.set_object(id, acro_form),
        None => {
            let mut catalog = catalog;
            catalog.set("AcroForm", acro_form);
            doc.set_object(catalog_id, catalog);
        }
    }

    let mut pdf = Vec::new();
    update.save_to(&mut pdf)?;

    let placeholder = format!("[0 {0} {0} {0}]", BYTE_RANGE_PLACEHOLDER);
    let byte_range_at = find(&pdf, source.len(), placeholder.as_bytes())
        .ok_or(Error::PlaceholderNotFound)?
        + 1;
    let contents_start = find(&pdf, byte_range_at, b"/Contents<")
        .ok_or(Error::PlaceholderNotFound)?
        + b"/Contents".len();
    let contents_end = contents_start + contents_reserve * 2 + 2;
    if pdf.get(contents_end - 1) != Some(&b'>') {
        return Err(Error::PlaceholderNotFound);
    }

    let byte_range = format!(
        "0 {:010} {:010} {:010}",
        contents_start,
        contents_end,
        pdf.len() - contents_end
    );
    pdf[byte_range_at..byte_range_at + byte_range.len()].copy_from_slice(byte_range.as_bytes());

    let mut signed_data = Vec::with_capacity(pdf.len() - (contents_end - contents_start));
    signed_data.extend_from_slice(&pdf[..contents_start]);
    signed_data.extend_from_slice(&pdf[contents_end..]);
    let der = sign_detached(&signed_data, entry, signature_type)?;

    if der.len() > contents_reserve {
        return Err(Error::ReservedSpaceTooSmall {
            needed: der.len(),
            reserved: contents_reserve,
        });
    }
    let hex: String = der.iter().map(|b| format!("{b:02X}")).collect();
    pdf[contents_start + 1..contents_start + 1 + hex.len()].copy_from_slice(hex.as_bytes());

    Ok(pdf)
}

fn find(haystack: &[u8], from: usize, needle: &[u8]) -> Option<usize> {
    haystack
        .get(from..)?
        .windows(needle.len())
        .position(|w| w == needle)
        .map(|at| from + at)
}

fn first_empty_signature_field(
    doc: &Document,
    acro_form: &Dictionary,
) -> Result<(ObjectId, Dictionary)> {
    for field in acro_form.get_deref(b"Fields", doc)?.as_array()? {
        // Only indirect fields can be replaced by the update.
        let Ok(id) = field.as_reference() else {
            continue;
        };
        let dict = doc.get_dictionary(id)?;
        let is_signature = matches!(dict.get(b"FT"), Ok(Object::Name(ft)) if ft == b"Sig");
        if is_signature && !dict.has(b"V") {
            return Ok((id, dict.clone()));
        }
    }
    Err(Error::NoEmptySignatureField)
}

fn widget_rect(doc: &Document, field: &Dictionary) -> Result<[f32; 4]> {
    let rect = field
        .get_deref(b"Rect", doc)
        .map_err(|_| Error::FieldWithoutWidget)?
        .as_array()?
        .iter()
        .map(|r| doc.dereference(r).and_then(|(_, r)| r.as_float()))
        .collect::<lopdf::Result<ExactArrayOrNone<f32, 4>>>()?
        .0
        .ok_or(lopdf::Error::Type)?;
    Ok(rect)
}

/// Form XObject drawing the stamp centred in the widget, keeping its aspect
/// ratio.
fn appearance_stream(rect: [f32; 4], stamp: &StampImage, image_id: ObjectId) -> Stream {
    let width = (rect[2] - rect[0]).abs();
    let height = (rect[3] - rect[1]).abs();

    let scale = (width / stamp.width as f32).min(height / stamp.height as f32);
    let (w, h) = (stamp.width as f32 * scale, stamp.height as f32 * scale);
    let (x, y) = ((width - w) / 2.0, (height - h) / 2.0);
    let content = format!("q {w:.3} 0 0 {h:.3} {x:.3} {y:.3} cm /Stamp Do Q");

    Stream::new(
        dictionary! {
            "Type" => "XObject",
            "Subtype" => "Form",
            "BBox" => vec![
                Object::Integer(0),
                Object::Integer(0),
                Object::Real(width),
                Object::Real(height),
            ],
            "Resources" => dictionary! {
                "XObject" => dictionary! { "Stamp" => image_id },
            },
        },
        content.into_bytes(),
    )
}

fn signer_common_name(entry: &PrivateKeyEntry) -> Option<String> {
    crate::signature::common_name(entry.certificate.subject_name()).ok()
}

fn sign_detached(
    data: &[u8],
    entry: &PrivateKeyEntry,
    signature_type: SignatureType,
) -> Result<Vec<u8>> {
    let mut chain = Stack::new()?;
    for cert in &entry.chain {
        chain.push(cert.clone())?;
    }

    let der = match signature_type {
        SignatureType::Cades => CmsContentInfo::sign(
            Some(&*entry.certificate),
            Some(&*entry.key),
            Some(&*chain),
            Some(data),
            CMSOptions::DETACHED | CMSOptions::BINARY,
        )?
        .to_der()?,
        SignatureType::Pkcs7 => Pkcs7::sign(
            &entry.certificate,
            &entry.key,
            &chain,
            data,
            Pkcs7Flags::DETACHED | Pkcs7Flags::BINARY,
        )?
        .to_der()?,
    };
    Ok(der)
}
