use std::{cell::RefCell, collections::HashMap};

use lopdf::{xref::XrefEntry, Dictionary, Document, Object, ObjectId};
use thiserror::Error;

use crate::ExactArrayOrNone;

#[derive(Error, Debug)]
pub enum Error {
    #[error("PDF parsing error")]
    Parsing(#[from] lopdf::Error),
    #[error("mismatch between /Catalog dictionaries")]
    CatalogMismatch,
    #[error("mismatch between /AcroForm dictionaries")]
    AcroFormMismatch,
    #[error("the /Fields array was modified")]
    FieldsModified,
    #[error("no field of the previous revision holds the signature")]
    SignatureFieldNotFound,
    #[error("signature field was changed beyond its value and appearance")]
    InvalidForm,
    #[error("wrong SigFlags value")]
    WrongSigFlags,
    #[error("mismatch between xref tables")]
    XrefMismatch,
}

type Result<T> = std::result::Result<T, Error>;

/// The widget a signature was placed on.
#[derive(Debug, Clone, PartialEq)]
pub struct Annotation {
    /// Index of the page holding the widget, when the field names its page.
    pub page_idx: Option<usize>,
    pub rect: [f32; 4],
}

struct DocTracker<'a> {
    traversed: RefCell<HashMap<u32, u16>>,
    doc: &'a Document,
}

impl<'a> DocTracker<'a> {
    fn new(doc: &'a Document) -> Self {
        DocTracker {
            traversed: RefCell::new(HashMap::new()),
            doc,
        }
    }

    fn catalog(&self) -> Result<DictTracker> {
        DictTracker {
            tracker: self,
            dict: &self.doc.trailer,
        }
        .get_dict_deref(b"Root")
    }

    fn get(&self, id: ObjectId) -> Result<&'a Object> {
        if let Some(gen) = self.traversed.borrow_mut().insert(id.0, id.1) {
            if gen != id.1 {
                return Err(lopdf::Error::ObjectIdMismatch.into());
            }
        }
        Ok(self.doc.get_object(id)?)
    }

    fn deref(&self, obj: &'a Object) -> Result<&'a Object> {
        // Only the first reference in a chain is tracked: that is the only
        // one an update needs to replace.
        match obj {
            Object::Reference(id) => self.get(*id),
            _ => Ok(obj),
        }
    }

    fn deref_dict(&self, obj: &'a Object) -> Result<DictTracker> {
        Ok(DictTracker {
            tracker: self,
            dict: self.deref(obj)?.as_dict()?,
        })
    }

    fn verify_all_changes_are_allowed(self, other: &Document) -> Result<()> {
        let traversed = self.traversed.into_inner();

        for (id, entry) in self.doc.reference_table.entries.iter() {
            if traversed.contains_key(id) {
                // This entry is allowed to be different.
                continue;
            }

            let Some(other_entry) = other.reference_table.entries.get(id) else {
                return Err(Error::XrefMismatch);
            };

            if XrefEntryComparer(entry) != XrefEntryComparer(other_entry) {
                return Err(Error::XrefMismatch);
            }
        }

        Ok(())
    }
}

struct DictTracker<'a> {
    tracker: &'a DocTracker<'a>,
    dict: &'a Dictionary,
}

impl<'a> DictTracker<'a> {
    fn get_dict_deref(&self, key: &[u8]) -> Result<DictTracker<'a>> {
        self.tracker.deref_dict(self.dict.get(key)?)
    }
}

/// XrefEntry does not implement PartialEq.
struct XrefEntryComparer<'a>(&'a XrefEntry);

impl PartialEq for XrefEntryComparer<'_> {
    fn eq(&self, other: &Self) -> bool {
        match (self.0, other.0) {
            (
                XrefEntry::Normal { offset, generation },
                XrefEntry::Normal {
                    offset: other_offset,
                    generation: other_generation,
                },
            ) => offset == other_offset && generation == other_generation,
            (
                XrefEntry::Compressed { container, index },
                XrefEntry::Compressed {
                    container: other_container,
                    index: other_index,
                },
            ) => container == other_container && index == other_index,
            (XrefEntry::Free, XrefEntry::Free)
            | (XrefEntry::UnusableFree, XrefEntry::UnusableFree) => true,
            _ => false,
        }
    }
}

/// Verifies that `curr_doc` only differs from `previous_doc` by `signature`
/// filling the empty signature field `field_id`.
pub(crate) fn verify_increment(
    previous_doc: &Document,
    curr_doc: &Document,
    field_id: ObjectId,
    signature: ObjectId,
) -> Result<Option<Annotation>> {
    let prev_doc_tracker = DocTracker::new(previous_doc);

    let annotation = verify_catalogs(curr_doc, &prev_doc_tracker, field_id, signature)?;

    prev_doc_tracker.verify_all_changes_are_allowed(curr_doc)?;

    Ok(annotation)
}

fn verify_catalogs(
    curr_doc: &Document,
    previous_doc: &DocTracker,
    field_id: ObjectId,
    signature: ObjectId,
) -> Result<Option<Annotation>> {
    let curr_catalog = curr_doc.catalog()?;
    let prev_catalog = previous_doc.catalog()?;

    let mut prev_acro_form = None;

    for (key, obj) in prev_catalog.dict.iter() {
        if key == b"AcroForm" {
            prev_acro_form = Some(previous_doc.deref_dict(obj)?);

            // AcroForm is handled separately.
            continue;
        }

        let curr_obj = curr_catalog.get(key)?;
        if curr_obj != obj {
            return Err(Error::CatalogMismatch);
        }
    }

    // A field can only be filled if the form already existed.
    let prev_acro_form = prev_acro_form.ok_or(Error::SignatureFieldNotFound)?;
    if prev_catalog.dict.len() != curr_catalog.len() {
        return Err(Error::CatalogMismatch);
    }

    let curr_acro_form = curr_doc.get_dict_in_dict(curr_catalog, b"AcroForm")?;
    verify_acro_forms(curr_doc, curr_acro_form, &prev_acro_form, field_id)?;

    verify_field(curr_doc, previous_doc, field_id, signature)
}

/// Only /SigFlags may change, and `field_id` must be one of the fields.
fn verify_acro_forms(
    curr_doc: &Document,
    curr_acro_form: &Dictionary,
    prev_acro_form: &DictTracker,
    field_id: ObjectId,
) -> Result<()> {
    let mut expected_len = prev_acro_form.dict.len() + 1;
    let mut prev_fields = None;

    for (key, obj) in prev_acro_form.dict.iter() {
        if key == b"SigFlags" {
            expected_len -= 1;
            continue;
        }

        if key == b"Fields" {
            prev_fields = Some(prev_acro_form.tracker.deref(obj)?.as_array()?);
        }

        let curr_obj = curr_acro_form.get(key)?;
        if curr_obj != obj {
            return Err(Error::AcroFormMismatch);
        }
    }

    if curr_acro_form.len() != expected_len {
        return Err(Error::AcroFormMismatch);
    }

    // Test /SigFlags expected value.
    if curr_acro_form.get(b"SigFlags")?.as_i64()? != 3 {
        return Err(Error::WrongSigFlags);
    }

    // The /Fields array itself, if indirect, must not have been rewritten.
    let curr_fields = curr_acro_form.get_deref(b"Fields", curr_doc)?.as_array()?;
    let prev_fields = prev_fields.ok_or(Error::SignatureFieldNotFound)?;
    if curr_fields != prev_fields {
        return Err(Error::FieldsModified);
    }

    if !curr_fields.contains(&Object::Reference(field_id)) {
        return Err(Error::SignatureFieldNotFound);
    }
    Ok(())
}

/// The field must have been an unsigned signature field, and may only have
/// gained /V and an appearance.
fn verify_field(
    curr_doc: &Document,
    previous_doc: &DocTracker,
    field_id: ObjectId,
    signature: ObjectId,
) -> Result<Option<Annotation>> {
    let curr_field = curr_doc.get_dictionary(field_id)?;
    let prev_field = previous_doc.get(field_id)?.as_dict()?;

    if prev_field.has(b"V") {
        return Err(Error::InvalidForm);
    }
    if curr_field.get(b"FT")? != &Object::Name(b"Sig".to_vec()) {
        return Err(Error::InvalidForm);
    }
    if curr_field.get(b"V")?.as_reference()? != signature {
        return Err(Error::InvalidForm);
    }

    let mut expected_len = prev_field.len() + 1;
    for (key, obj) in prev_field.iter() {
        if key == b"AP" {
            continue;
        }
        if curr_field.get(key)? != obj {
            return Err(Error::InvalidForm);
        }
    }
    if !prev_field.has(b"AP") && curr_field.has(b"AP") {
        expected_len += 1;
    }
    if curr_field.len() != expected_len {
        return Err(Error::InvalidForm);
    }

    let rect = match curr_field.get_deref(b"Rect", curr_doc) {
        Ok(rect) => rect
            .as_array()?
            .iter()
            .map(|r| curr_doc.dereference(r).and_then(|(_, r)| r.as_float()))
            .collect::<lopdf::Result<ExactArrayOrNone<f32, 4>>>()?
            .0
            .ok_or(lopdf::Error::Type)?,
        // Fields without a widget of their own are invisible signatures.
        Err(lopdf::Error::DictKey) => return Ok(None),
        Err(e) => return Err(e.into()),
    };

    let page_idx = match curr_field.get(b"P") {
        Ok(page) => find_page_index(curr_doc, page.as_reference()?),
        Err(_) => None,
    };

    Ok(Some(Annotation { page_idx, rect }))
}

fn find_page_index(doc: &Document, page_id: ObjectId) -> Option<usize> {
    doc.get_pages()
        .into_iter()
        .find(|(_, id)| *id == page_id)
        .map(|(number, _)| number as usize - 1)
}
