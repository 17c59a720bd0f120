use std::ops::Range;

use lopdf::{xref::XrefEntry, Document, Object, ObjectId};
use regex::bytes::Regex;
use thiserror::Error;

use crate::increment::{self, Annotation};
use crate::signature::{DetachedSignature, SignerInfo, TrustPolicy};
use crate::ExactArrayOrNone;

#[derive(Error, Debug)]
pub enum Error {
    #[error("PDF parsing error")]
    Parsing(#[from] lopdf::Error),
    #[error("reference document does not end like a PDF file")]
    InvalidReferenceDocument,
    #[error("signed document does not start with the reference document")]
    PossibleContentChange,
    #[error("update after the reference document carries no signature")]
    UnsignedUpdate,
    #[error("update after the reference document carries more than one signature")]
    MultipleSignatures,
    #[error("signature value is not an indirect dictionary inside the update")]
    InvalidSignatureObject,
    #[error("malformed /ByteRange")]
    InvalidRange,
    #[error("/ByteRange does not cover the whole document except /Contents")]
    InvalidCoverage,
    #[error("incremental update does not only fill a signature field")]
    Increment(#[from] increment::Error),
    #[error("signature verification error")]
    SignatureVerification(#[from] crate::signature::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

/// The signature the update added, after every check passed.
#[derive(Debug)]
pub struct VerifiedSignature {
    pub signers: Vec<SignerInfo>,
    /// Widget the signature was placed on, if it is visible.
    pub annotation: Option<Annotation>,
    /// The two byte ranges around `/Contents`.
    pub signed_byte_ranges: [Range<usize>; 2],
}

/// Checks that `signed` is `reference` plus one incremental update that
/// fills a signature field, and that the signature covers the whole file.
///
/// Returns `None` when `signed` is the reference itself.
pub fn verify_from_reference(
    reference: impl AsRef<[u8]>,
    signed: impl AsRef<[u8]>,
    trust: &TrustPolicy,
) -> Result<Option<VerifiedSignature>> {
    let (reference, signed) = (reference.as_ref(), signed.as_ref());

    if !pdf_ends_with_eof(reference) {
        return Err(Error::InvalidReferenceDocument);
    }
    if !signed.starts_with(reference) {
        return Err(Error::PossibleContentChange);
    }
    if signed.len() == reference.len() {
        return Ok(None);
    }

    let before = Document::load_mem(reference)?;
    let after = Document::load_mem(signed)?;

    let (field_id, signature_id) = added_signature(&before, &after)?;
    let signature = after.get_dictionary(signature_id)?;

    let byte_range = signature
        .get_deref(b"ByteRange", &after)?
        .as_array()?
        .iter()
        .map(|r| r.as_i64().ok().and_then(|r| usize::try_from(r).ok()))
        .collect::<Option<ExactArrayOrNone<usize, 4>>>()
        .and_then(|r| r.0)
        .ok_or(Error::InvalidRange)?;
    let [start, gap_start, gap_end, tail_len] = byte_range;
    if start != 0 || gap_start >= gap_end || gap_end.checked_add(tail_len) != Some(signed.len()) {
        return Err(Error::InvalidCoverage);
    }

    // The dictionary must come from the update and sit before its own gap.
    match after.reference_table.get(signature_id.0) {
        Some(XrefEntry::Normal { offset, .. })
            if (*offset as usize) >= reference.len() && (*offset as usize) < gap_start => {}
        _ => return Err(Error::InvalidSignatureObject),
    }

    let der = signature.get(b"Contents")?.as_str()?;
    if hex_string(&signed[gap_start..gap_end]).as_deref() != Some(der) {
        return Err(Error::InvalidCoverage);
    }
    if !pdf_ends_with_eof(signed) {
        return Err(Error::InvalidCoverage);
    }

    let annotation = increment::verify_increment(&before, &after, field_id, signature_id)?;

    let signed_byte_ranges = [0..gap_start, gap_end..signed.len()];
    let mut content = Vec::with_capacity(signed.len() - (gap_end - gap_start));
    for range in &signed_byte_ranges {
        content.extend_from_slice(&signed[range.clone()]);
    }

    let detached = DetachedSignature::from_der(der)?;
    let signers = detached.signers()?;
    detached.check(&content, trust)?;

    Ok(Some(VerifiedSignature {
        signers,
        annotation,
        signed_byte_ranges,
    }))
}

/// The one signature field that is filled in `after` but was empty in
/// `before`, with the id of its signature dictionary.
fn added_signature(before: &Document, after: &Document) -> Result<(ObjectId, ObjectId)> {
    let acro_form = match after.get_dict_in_dict(after.catalog()?, b"AcroForm") {
        Ok(acro_form) => acro_form,
        Err(lopdf::Error::DictKey) => return Err(Error::UnsignedUpdate),
        Err(e) => return Err(e.into()),
    };

    let mut added = None;
    for field in acro_form.get_deref(b"Fields", after)?.as_array()? {
        let Ok(field_id) = field.as_reference() else {
            continue;
        };
        let field = after.get_dictionary(field_id)?;
        if !matches!(field.get(b"FT"), Ok(Object::Name(ft)) if ft == b"Sig") {
            continue;
        }
        let Ok(value) = field.get(b"V") else {
            continue;
        };
        let was_filled = before
            .get_dictionary(field_id)
            .is_ok_and(|previous| previous.has(b"V"));
        if was_filled {
            continue;
        }

        let signature_id = value
            .as_reference()
            .map_err(|_| Error::InvalidSignatureObject)?;
        if added.replace((field_id, signature_id)).is_some() {
            return Err(Error::MultipleSignatures);
        }
    }
    added.ok_or(Error::UnsignedUpdate)
}

/// Bytes of a `<...>` string as it appears in the file. Whitespace is
/// skipped and an odd final digit counts as if followed by zero.
fn hex_string(raw: &[u8]) -> Option<Vec<u8>> {
    let digits = raw.strip_prefix(b"<")?.strip_suffix(b">")?;
    let mut nibbles = digits
        .iter()
        .filter(|b| !b.is_ascii_whitespace())
        .map(|&b| (b as char).to_digit(16).map(|d| d as u8));

    let mut bytes = Vec::with_capacity(digits.len() / 2);
    while let Some(high) = nibbles.next() {
        let low = nibbles.next().unwrap_or(Some(0))?;
        bytes.push(high? << 4 | low);
    }
    Some(bytes)
}

lazy_static::lazy_static! {
    static ref EOF_REGEX: Regex = Regex::new(r"(?:\r\n|\r|\n)%%EOF[ \t]*(?:\r\n|\r|\n)?$").unwrap();
}

/// Whether the file ends with a `%%EOF` line.
pub(crate) fn pdf_ends_with_eof(pdf_bytes: &[u8]) -> bool {
    EOF_REGEX.is_match(pdf_bytes)
}
