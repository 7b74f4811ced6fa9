//! Texture buffers, texture-set interning (§4.4) and the texture-set
//! encoder (§4.5).

use std::collections::HashMap;

use bytes::Bytes;
use parking_lot::Mutex;

use crate::Error;

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, serde::Serialize)]
pub enum RasterFormat {
    Jpeg,
    Png,
    Dxt,
    Etc2,
}

impl RasterFormat {
    /// The legacy per-format tag used in `sharedResource.json` / the
    /// texture-definition record, chosen for reader compatibility.
    pub fn legacy_tag(self) -> &'static str {
        match self {
            RasterFormat::Jpeg | RasterFormat::Png => "0",
            RasterFormat::Dxt => "0_0_1",
            RasterFormat::Etc2 => "0_0_2",
        }
    }

    pub fn bit(self) -> u8 {
        match self {
            RasterFormat::Jpeg => 1 << 0,
            RasterFormat::Png => 1 << 1,
            RasterFormat::Dxt => 1 << 2,
            RasterFormat::Etc2 => 1 << 3,
        }
    }

    pub const ALL: [RasterFormat; 4] = [
        RasterFormat::Jpeg,
        RasterFormat::Png,
        RasterFormat::Dxt,
        RasterFormat::Etc2,
    ];
}

/// A bitmask over [`RasterFormat`] plus an atlas flag; the key a texture
/// set is interned by.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct TextureSetKey {
    pub formats: u8,
    pub is_atlas: bool,
}

impl TextureSetKey {
    pub fn contains(self, format: RasterFormat) -> bool {
        self.formats & format.bit() != 0
    }

    pub fn insert(&mut self, format: RasterFormat) {
        self.formats |= format.bit();
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum AlphaStatus {
    Opaque,
    MaskOrBlend,
    Unknown,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum TextureWrap {
    Clamp,
    Repeat,
}

/// Immutable per-image metadata.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct TextureMeta {
    pub format: RasterFormat,
    pub width: u32,
    pub height: u32,
    pub mip_count: u32,
    pub alpha: AlphaStatus,
    pub wrap: TextureWrap,
    pub is_atlas: bool,
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct TextureImage {
    pub meta: TextureMeta,
    pub bytes: Bytes,
}

/// A multi-format encoding of one logical image (0..N entries), plus an
/// optional raw RGBA source. When submitted as the `source` of
/// [`build_texture_set`], a raw buffer is the canonical source and is used
/// directly, ahead of decoding any JPEG/PNG entry in `images` (§4.5 step 1).
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct TextureBuffer {
    pub images: Vec<TextureImage>,
    pub raw: Option<RawImage>,
}

impl TextureBuffer {
    pub fn get(&self, format: RasterFormat) -> Option<&TextureImage> {
        self.images.iter().find(|i| i.meta.format == format)
    }

    pub fn key(&self) -> TextureSetKey {
        let mut key = TextureSetKey::default();
        for image in &self.images {
            key.insert(image.meta.format);
            key.is_atlas = key.is_atlas || image.meta.is_atlas;
        }
        key
    }
}

/// Raw, always-RGBA8 pixel buffer used as the canonical intermediate for
/// the texture-set encoder, and as the client-submittable raw source format.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct RawImage {
    pub width: u32,
    pub height: u32,
    pub rgba: Vec<u8>,
}

type EncodeFn = Box<dyn Fn(&RawImage) -> Result<TextureImage, Error> + Send + Sync>;
type DecodeFn = Box<dyn Fn(&[u8]) -> Result<RawImage, Error> + Send + Sync>;

/// The image-codec closures injected at writer construction. Any missing
/// closure disables the corresponding format from the encoder's output.
#[derive(Default)]
pub struct ImageCodecs {
    pub encode_jpeg: Option<EncodeFn>,
    pub encode_png: Option<EncodeFn>,
    pub encode_dxt: Option<EncodeFn>,
    pub encode_etc2: Option<EncodeFn>,
    pub decode_jpeg: Option<DecodeFn>,
    pub decode_png: Option<DecodeFn>,
}

/// Texture-definition record entry: one per bit set in a `TextureSetKey`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TextureDefinitionEntry {
    pub format: RasterFormat,
    pub legacy_tag: &'static str,
}

/// Interns texture-set shapes keyed by `(format bitmask, is_atlas)`,
/// assigning small integer IDs. Thread-safe.
#[derive(Default)]
pub struct TextureSetInterner {
    inner: Mutex<InternerState>,
}

#[derive(Default)]
struct InternerState {
    by_key: HashMap<TextureSetKey, u32>,
    ordered: Vec<TextureSetKey>,
}

impl TextureSetInterner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn intern(&self, key: TextureSetKey) -> u32 {
        let mut state = self.inner.lock();
        if let Some(&id) = state.by_key.get(&key) {
            return id;
        }
        let id = state.ordered.len() as u32;
        state.ordered.push(key);
        state.by_key.insert(key, id);
        id
    }

    pub fn definitions(&self) -> Vec<Vec<TextureDefinitionEntry>> {
        self.inner
            .lock()
            .ordered
            .iter()
            .map(|key| {
                RasterFormat::ALL
                    .into_iter()
                    .filter(|f| key.contains(*f))
                    .map(|format| TextureDefinitionEntry {
                        format,
                        legacy_tag: format.legacy_tag(),
                    })
                    .collect()
            })
            .collect()
    }
}

fn scan_alpha(rgba: &[u8]) -> AlphaStatus {
    let mut saw_zero_or_full = false;
    let mut saw_intermediate = false;
    for a in rgba.iter().skip(3).step_by(4) {
        match *a {
            0 | 255 => saw_zero_or_full = true,
            _ => saw_intermediate = true,
        }
    }
    if saw_intermediate {
        AlphaStatus::MaskOrBlend
    } else if saw_zero_or_full {
        // All-255 only would mean opaque; any 0 alongside 255 means a hard
        // cutout mask. Distinguish by checking for any non-255 value.
        if rgba.iter().skip(3).step_by(4).all(|&a| a == 255) {
            AlphaStatus::Opaque
        } else {
            AlphaStatus::MaskOrBlend
        }
    } else {
        AlphaStatus::Opaque
    }
}

/// Downsamples `image` to fit within `max_size` on its larger dimension,
/// preserving aspect ratio, using premultiplied-alpha box filtering.
fn resample_to_fit(image: &RawImage, max_size: u32) -> RawImage {
    let largest = image.width.max(image.height);
    if largest <= max_size {
        return image.clone();
    }
    let scale = max_size as f64 / largest as f64;
    let new_w = ((image.width as f64 * scale).round() as u32).max(1);
    let new_h = ((image.height as f64 * scale).round() as u32).max(1);

    let mut out = vec![0u8; (new_w * new_h * 4) as usize];
    for y in 0..new_h {
        for x in 0..new_w {
            let src_x0 = (x as f64 / scale) as u32;
            let src_y0 = (y as f64 / scale) as u32;
            let src_x1 = (((x + 1) as f64 / scale) as u32).max(src_x0 + 1).min(image.width);
            let src_y1 = (((y + 1) as f64 / scale) as u32).max(src_y0 + 1).min(image.height);

            let (mut rp, mut gp, mut bp, mut ap, mut n) = (0.0, 0.0, 0.0, 0.0, 0.0);
            for sy in src_y0..src_y1 {
                for sx in src_x0..src_x1 {
                    let idx = ((sy * image.width + sx) * 4) as usize;
                    let a = image.rgba[idx + 3] as f64 / 255.0;
                    rp += image.rgba[idx] as f64 * a;
                    gp += image.rgba[idx + 1] as f64 * a;
                    bp += image.rgba[idx + 2] as f64 * a;
                    ap += a;
                    n += 1.0;
                }
            }
            let out_idx = ((y * new_w + x) * 4) as usize;
            if ap > 0.0 {
                out[out_idx] = (rp / ap).round().clamp(0.0, 255.0) as u8;
                out[out_idx + 1] = (gp / ap).round().clamp(0.0, 255.0) as u8;
                out[out_idx + 2] = (bp / ap).round().clamp(0.0, 255.0) as u8;
            }
            out[out_idx + 3] = ((ap / n.max(1.0)) * 255.0).round().clamp(0.0, 255.0) as u8;
        }
    }

    RawImage {
        width: new_w,
        height: new_h,
        rgba: out,
    }
}

/// Produces the context-configured set of image formats from a source
/// `TextureBuffer`: picks (or decodes) a raw canonical source, resamples if
/// oversized, then invokes whichever encoder closures are registered for
/// formats not already present.
pub fn build_texture_set(
    source: &TextureBuffer,
    desired: TextureSetKey,
    max_texture_size: u32,
    codecs: &ImageCodecs,
    is_atlas: bool,
) -> Result<TextureBuffer, Error> {
    let mut raw = if let Some(raw) = &source.raw {
        raw.clone()
    } else if let Some(png) = source.get(RasterFormat::Png) {
        let decode = codecs.decode_png.as_ref().ok_or(Error::MissingJpgOrPng)?;
        decode(&png.bytes).map_err(|_| Error::ImageDecodingError(RasterFormat::Png))?
    } else if let Some(jpeg) = source.get(RasterFormat::Jpeg) {
        let decode = codecs.decode_jpeg.as_ref().ok_or(Error::MissingJpgOrPng)?;
        decode(&jpeg.bytes).map_err(|_| Error::ImageDecodingError(RasterFormat::Jpeg))?
    } else {
        return Err(Error::MissingJpgOrPng);
    };

    let alpha = scan_alpha(&raw.rgba);

    if raw.width.max(raw.height) > max_texture_size {
        let (src_w, src_h) = (raw.width, raw.height);
        raw = resample_to_fit(&raw, max_texture_size);
        tracing::debug!(src_w, src_h, dst_w = raw.width, dst_h = raw.height, "resampled oversized texture");
    }

    let mut images = Vec::new();
    for format in RasterFormat::ALL {
        if let Some(existing) = source.get(format) {
            if existing.meta.width == raw.width && existing.meta.height == raw.height {
                images.push(existing.clone());
                continue;
            }
        }
        if !desired.contains(format) {
            continue;
        }
        let encoder = match format {
            RasterFormat::Jpeg => codecs.encode_jpeg.as_ref(),
            RasterFormat::Png => codecs.encode_png.as_ref(),
            RasterFormat::Dxt => codecs.encode_dxt.as_ref(),
            RasterFormat::Etc2 => codecs.encode_etc2.as_ref(),
        };
        let Some(encoder) = encoder else {
            continue;
        };
        let mut image = encoder(&raw).map_err(|_| Error::ImageEncodingError(format))?;
        image.meta.alpha = alpha;
        image.meta.is_atlas = is_atlas;
        images.push(image);
    }

    Ok(TextureBuffer { images, raw: None })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stub_image(format: RasterFormat, width: u32, height: u32) -> TextureImage {
        TextureImage {
            meta: TextureMeta {
                format,
                width,
                height,
                mip_count: 1,
                alpha: AlphaStatus::Opaque,
                wrap: TextureWrap::Clamp,
                is_atlas: false,
            },
            bytes: Bytes::from_static(b"stub"),
        }
    }

    #[test]
    fn texture_set_interner_assigns_dense_ids() {
        let interner = TextureSetInterner::new();
        let key_a = TextureBuffer {
            images: vec![stub_image(RasterFormat::Png, 4, 4)],
            raw: None,
        }
        .key();
        let key_b = TextureBuffer {
            images: vec![stub_image(RasterFormat::Jpeg, 4, 4)],
            raw: None,
        }
        .key();
        assert_eq!(interner.intern(key_a), 0);
        assert_eq!(interner.intern(key_b), 1);
        assert_eq!(interner.intern(key_a), 0);
    }

    #[test]
    fn resample_preserves_aspect_ratio() {
        let image = RawImage {
            width: 2048,
            height: 1024,
            rgba: vec![255u8; 2048 * 1024 * 4],
        };
        let resized = resample_to_fit(&image, 1024);
        assert_eq!(resized.width, 1024);
        assert_eq!(resized.height, 512);
    }

    #[test]
    fn raw_source_is_used_directly_without_decoding() {
        let source = TextureBuffer {
            images: Vec::new(),
            raw: Some(RawImage {
                width: 4,
                height: 4,
                rgba: vec![255u8; 4 * 4 * 4],
            }),
        };
        let mut codecs = ImageCodecs::default();
        // No decode_png/decode_jpeg closure registered: a raw source must
        // never reach that decoding path.
        codecs.encode_png = Some(Box::new(|raw: &RawImage| {
            Ok(TextureImage {
                meta: TextureMeta {
                    format: RasterFormat::Png,
                    width: raw.width,
                    height: raw.height,
                    mip_count: 1,
                    alpha: AlphaStatus::Opaque,
                    wrap: TextureWrap::Clamp,
                    is_atlas: false,
                },
                bytes: Bytes::from_static(b"encoded-from-raw"),
            })
        }));
        let mut desired = TextureSetKey::default();
        desired.insert(RasterFormat::Png);

        let built = build_texture_set(&source, desired, 4096, &codecs, false).unwrap();
        let png = built.get(RasterFormat::Png).unwrap();
        assert_eq!(png.meta.width, 4);
        assert_eq!(png.meta.height, 4);
    }

    #[test]
    fn missing_source_is_an_error() {
        let codecs = ImageCodecs::default();
        let result = build_texture_set(
            &TextureBuffer::default(),
            TextureSetKey::default(),
            4096,
            &codecs,
            false,
        );
        assert!(matches!(result, Err(Error::MissingJpgOrPng)));
    }
}
