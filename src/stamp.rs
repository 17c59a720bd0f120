use std::io::{Cursor, Write};
use std::path::Path;

use flate2::{write::ZlibEncoder, Compression};
use image::codecs::jpeg::JpegDecoder;
use image::{DynamicImage, ExtendedColorType, ImageDecoder, ImageFormat};
use lopdf::{dictionary, Dictionary, Object, Stream};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("can not read stamp image")]
    Io(#[from] std::io::Error),
    #[error("can not decode stamp image")]
    Decode(#[from] image::ImageError),
    #[error("stamp is neither a PNG nor a JPEG image")]
    UnknownFormat,
    #[error("unsupported stamp image: {0}")]
    Unsupported(String),
}

type Result<T> = std::result::Result<T, Error>;

/// A decoded stamp, ready to be added to a PDF document.
#[derive(Debug)]
pub struct StampImage {
    pub width: u32,
    pub height: u32,
    /// The `/Subtype /Image` XObject, without the `/SMask` entry.
    pub image: Stream,
    /// Alpha channel of the source, if it had one.
    pub soft_mask: Option<Stream>,
}

impl StampImage {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let bytes = std::fs::read(path)?;
        Self::from_bytes(&bytes)
    }

    /// JPEG data is embedded as is. Everything else is decoded to 8 or 16
    /// bit samples and recompressed, with transparency moved to a soft mask.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        match image::guess_format(bytes) {
            Ok(ImageFormat::Jpeg) => from_jpeg(bytes),
            Ok(ImageFormat::Png) => {
                from_decoded(image::load_from_memory_with_format(bytes, ImageFormat::Png)?)
            }
            _ => Err(Error::UnknownFormat),
        }
    }
}

fn image_dict(width: u32, height: u32, color_space: &str, bits: u8) -> Dictionary {
    dictionary! {
        "Type" => "XObject",
        "Subtype" => "Image",
        "Width" => Object::Integer(width as i64),
        "Height" => Object::Integer(height as i64),
        "ColorSpace" => color_space,
        "BitsPerComponent" => Object::Integer(bits as i64),
    }
}

fn from_jpeg(bytes: &[u8]) -> Result<StampImage> {
    let decoder = JpegDecoder::new(Cursor::new(bytes))?;
    let (width, height) = decoder.dimensions();
    let color_space = match decoder.original_color_type() {
        ExtendedColorType::L8 => "DeviceGray",
        ExtendedColorType::Rgb8 => "DeviceRGB",
        ExtendedColorType::Cmyk8 => "DeviceCMYK",
        other => return Err(Error::Unsupported(format!("JPEG with {other:?} samples"))),
    };

    let mut dict = image_dict(width, height, color_space, 8);
    dict.set("Filter", "DCTDecode");
    Ok(StampImage {
        width,
        height,
        image: Stream::new(dict, bytes.to_vec()),
        soft_mask: None,
    })
}

/// Sample planes of a decoded image, in PDF byte order.
struct Planes {
    color_space: &'static str,
    bits: u8,
    color: Vec<u8>,
    alpha: Option<Vec<u8>>,
}

impl Planes {
    fn new<T: Copy>(
        color_space: &'static str,
        samples: &[T],
        with_alpha: bool,
        to_bytes: fn(&[T]) -> Vec<u8>,
    ) -> Self {
        let channels = if color_space == "DeviceGray" { 1 } else { 3 };
        let bits = (std::mem::size_of::<T>() * 8) as u8;
        if !with_alpha {
            return Self {
                color_space,
                bits,
                color: to_bytes(samples),
                alpha: None,
            };
        }

        let pixels = samples.len() / (channels + 1);
        let mut color = Vec::with_capacity(pixels * channels);
        let mut alpha = Vec::with_capacity(pixels);
        for pixel in samples.chunks_exact(channels + 1) {
            color.extend_from_slice(&pixel[..channels]);
            alpha.push(pixel[channels]);
        }
        Self {
            color_space,
            bits,
            color: to_bytes(&color),
            alpha: Some(to_bytes(&alpha)),
        }
    }
}

fn eight_bit(samples: &[u8]) -> Vec<u8> {
    samples.to_vec()
}

fn sixteen_bit(samples: &[u16]) -> Vec<u8> {
    samples.iter().flat_map(|s| s.to_be_bytes()).collect()
}

fn from_decoded(decoded: DynamicImage) -> Result<StampImage> {
    let (width, height) = (decoded.width(), decoded.height());

    let planes = match decoded {
        DynamicImage::ImageLuma8(img) => Planes::new("DeviceGray", img.as_raw(), false, eight_bit),
        DynamicImage::ImageLumaA8(img) => Planes::new("DeviceGray", img.as_raw(), true, eight_bit),
        DynamicImage::ImageRgb8(img) => Planes::new("DeviceRGB", img.as_raw(), false, eight_bit),
        DynamicImage::ImageRgba8(img) => Planes::new("DeviceRGB", img.as_raw(), true, eight_bit),
        DynamicImage::ImageLuma16(img) => {
            Planes::new("DeviceGray", img.as_raw(), false, sixteen_bit)
        }
        DynamicImage::ImageLumaA16(img) => {
            Planes::new("DeviceGray", img.as_raw(), true, sixteen_bit)
        }
        DynamicImage::ImageRgb16(img) => Planes::new("DeviceRGB", img.as_raw(), false, sixteen_bit),
        DynamicImage::ImageRgba16(img) => Planes::new("DeviceRGB", img.as_raw(), true, sixteen_bit),
        other => Planes::new("DeviceRGB", other.to_rgba16().as_raw(), true, sixteen_bit),
    };

    let mut dict = image_dict(width, height, planes.color_space, planes.bits);
    dict.set("Filter", "FlateDecode");

    let soft_mask = match &planes.alpha {
        Some(alpha) => {
            let mut mask_dict = image_dict(width, height, "DeviceGray", planes.bits);
            mask_dict.set("Filter", "FlateDecode");
            Some(Stream::new(mask_dict, deflate(alpha)?))
        }
        None => None,
    };

    Ok(StampImage {
        width,
        height,
        image: Stream::new(dict, deflate(&planes.color)?),
        soft_mask,
    })
}

fn deflate(data: &[u8]) -> Result<Vec<u8>> {
    let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(data)?;
    Ok(encoder.finish()?)
}
