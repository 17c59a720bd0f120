#![allow(dead_code)]

use std::io::{Cursor, Write};
use std::path::Path;

use flate2::write::ZlibEncoder;
use flate2::{Compression, Crc};
use image::{DynamicImage, GrayImage, ImageFormat, Luma, Rgb, RgbImage};
use lopdf::{dictionary, Dictionary, Document, Object, Stream};
use openssl::asn1::Asn1Time;
use openssl::bn::BigNum;
use openssl::hash::MessageDigest;
use openssl::nid::Nid;
use openssl::pkcs12::Pkcs12;
use openssl::pkey::PKey;
use openssl::rsa::Rsa;
use openssl::x509::{X509NameBuilder, X509};

pub const SIGNER: &str = "Example Signer";
pub const PASSPHRASE: &str = "test";

/// One page with an empty, visible signature field merged with its widget.
pub fn form_pdf(with_signature_field: bool) -> Vec<u8> {
    let mut doc = Document::with_version("1.7");

    let pages_id = doc.new_object_id();
    let page_id = doc.new_object_id();
    let content_id = doc.add_object(Stream::new(Dictionary::new(), b"BT ET".to_vec()));

    let mut fields = Vec::new();
    let mut annots = Vec::new();
    if with_signature_field {
        let field_id = doc.add_object(dictionary! {
            "Type" => "Annot",
            "Subtype" => "Widget",
            "FT" => "Sig",
            "T" => Object::string_literal("Signature1"),
            "F" => Object::Integer(4),
            "Rect" => vec![
                Object::Integer(100),
                Object::Integer(600),
                Object::Integer(300),
                Object::Integer(680),
            ],
            "P" => page_id,
        });
        fields.push(Object::Reference(field_id));
        annots.push(Object::Reference(field_id));
    }

    doc.objects.insert(
        page_id,
        Object::Dictionary(dictionary! {
            "Type" => "Page",
            "Parent" => pages_id,
            "MediaBox" => vec![
                Object::Integer(0),
                Object::Integer(0),
                Object::Integer(595),
                Object::Integer(842),
            ],
            "Contents" => content_id,
            "Annots" => annots,
        }),
    );
    doc.objects.insert(
        pages_id,
        Object::Dictionary(dictionary! {
            "Type" => "Pages",
            "Kids" => vec![Object::Reference(page_id)],
            "Count" => Object::Integer(1),
        }),
    );

    let acro_form_id = doc.add_object(dictionary! { "Fields" => fields });
    let catalog_id = doc.add_object(dictionary! {
        "Type" => "Catalog",
        "Pages" => pages_id,
        "AcroForm" => acro_form_id,
    });
    doc.trailer.set("Root", catalog_id);

    let mut bytes = Vec::new();
    doc.save_to(&mut bytes).unwrap();
    bytes
}

/// Self-signed RSA certificate and key, as a PKCS #12 store.
pub fn key_store() -> Vec<u8> {
    let key = PKey::from_rsa(Rsa::generate(2048).unwrap()).unwrap();

    let mut name = X509NameBuilder::new().unwrap();
    name.append_entry_by_nid(Nid::COMMONNAME, SIGNER).unwrap();
    let name = name.build();

    let mut builder = X509::builder().unwrap();
    builder.set_version(2).unwrap();
    let serial = BigNum::from_u32(7).unwrap().to_asn1_integer().unwrap();
    builder.set_serial_number(&serial).unwrap();
    builder.set_subject_name(&name).unwrap();
    builder.set_issuer_name(&name).unwrap();
    builder.set_pubkey(&key).unwrap();
    builder
        .set_not_before(&Asn1Time::days_from_now(0).unwrap())
        .unwrap();
    builder
        .set_not_after(&Asn1Time::days_from_now(30).unwrap())
        .unwrap();
    builder.sign(&key, MessageDigest::sha256()).unwrap();
    let cert = builder.build();

    Pkcs12::builder()
        .name(SIGNER)
        .pkey(&key)
        .cert(&cert)
        .build2(PASSPHRASE)
        .unwrap()
        .to_der()
        .unwrap()
}

fn png_chunk(out: &mut Vec<u8>, kind: &[u8], data: &[u8]) {
    out.extend_from_slice(&(data.len() as u32).to_be_bytes());
    out.extend_from_slice(kind);
    out.extend_from_slice(data);
    let mut crc = Crc::new();
    crc.update(kind);
    crc.update(data);
    out.extend_from_slice(&crc.sum().to_be_bytes());
}

/// A PNG from raw scanlines, each starting with its filter byte.
///
/// `header` holds the bit depth, color type and interlace method. `extra`
/// chunks are written between IHDR and IDAT.
pub fn png(
    width: u32,
    height: u32,
    header: [u8; 3],
    extra: &[(&[u8], &[u8])],
    rows: &[u8],
) -> Vec<u8> {
    let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(rows).unwrap();
    let idat = encoder.finish().unwrap();

    let mut ihdr = width.to_be_bytes().to_vec();
    ihdr.extend_from_slice(&height.to_be_bytes());
    ihdr.extend_from_slice(&[header[0], header[1], 0, 0, header[2]]);

    let mut out = b"\x89PNG\r\n\x1a\n".to_vec();
    png_chunk(&mut out, b"IHDR", &ihdr);
    for (kind, data) in extra {
        png_chunk(&mut out, kind, data);
    }
    png_chunk(&mut out, b"IDAT", &idat);
    png_chunk(&mut out, b"IEND", &[]);
    out
}

/// An 8-bit PNG filled with `pixel`; 3 bytes per pixel is RGB, 4 is RGBA.
pub fn solid_png(width: u32, height: u32, pixel: &[u8]) -> Vec<u8> {
    let color_type = match pixel.len() {
        3 => 2,
        4 => 6,
        n => panic!("unsupported pixel size {n}"),
    };

    let mut rows = Vec::new();
    for _ in 0..height {
        rows.push(0);
        for _ in 0..width {
            rows.extend_from_slice(pixel);
        }
    }
    png(width, height, [8, color_type, 0], &[], &rows)
}

/// A baseline JPEG filled with `pixel`; 1 byte per pixel is gray, 3 is RGB.
pub fn solid_jpeg(width: u32, height: u32, pixel: &[u8]) -> Vec<u8> {
    let image = match *pixel {
        [l] => DynamicImage::ImageLuma8(GrayImage::from_pixel(width, height, Luma([l]))),
        [r, g, b] => DynamicImage::ImageRgb8(RgbImage::from_pixel(width, height, Rgb([r, g, b]))),
        _ => panic!("unsupported pixel size {}", pixel.len()),
    };
    let mut out = Vec::new();
    image
        .write_to(&mut Cursor::new(&mut out), ImageFormat::Jpeg)
        .unwrap();
    out
}

/// Lays out an asset tree the way the suite expects it under `root`.
pub fn write_assets(root: &Path, stamps: &[(&str, Vec<u8>)]) {
    let folder = root.join("signature-testimages");
    std::fs::create_dir_all(&folder).unwrap();
    for (name, bytes) in stamps {
        std::fs::write(folder.join(name), bytes).unwrap();
    }
    std::fs::write(root.join("Form_example.pdf"), form_pdf(true)).unwrap();
    std::fs::write(root.join("ExampleSigner.p12"), key_store()).unwrap();
}
