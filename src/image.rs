use anyhow::bail;
use bytes::Bytes;
use image::{ImageBuffer, RgbImage};
use jpeg_encoder::{ColorType, Encoder};
use std::{fmt, path::Path, time::Instant};
use tracing::{debug, info};
use zune_core::{colorspace::ColorSpace, options::DecoderOptions};
use zune_jpeg::JpegDecoder;

pub struct Image {
    pub name: Option<String>,
    pub width: usize,
    pub height: usize,
    pub pixels: Vec<u8>,
}

impl Image {
    pub fn resize(&mut self, size: usize) {
        self.pixels.resize(size, 0);
    }

    pub fn from_rgb(name: Option<String>, rgb: RgbImage) -> Self {
        Self {
            name,
            width: rgb.width() as usize,
            height: rgb.height() as usize,
            pixels: rgb.into_raw(),
        }
    }

    /// Copies the pixels inside `region` into a standalone RGB image.
    pub fn crop(&self, region: &PixelRegion) -> anyhow::Result<RgbImage> {
        let region = region.clamp(self.width as u32, self.height as u32);
        if region.width() == 0 || region.height() == 0 {
            bail!("Crop region {:?} is empty for image {}", region, self);
        }
        let row_len = region.width() as usize * 3;
        let mut pixels = Vec::with_capacity(row_len * region.height() as usize);
        for y in region.y_min..region.y_max {
            let start = (y as usize * self.width + region.x_min as usize) * 3;
            pixels.extend_from_slice(&self.pixels[start..start + row_len]);
        }
        ImageBuffer::from_vec(region.width(), region.height(), pixels)
            .ok_or_else(|| anyhow::anyhow!("Failed to create crop buffer"))
    }

    pub fn to_rgb_image(&self) -> anyhow::Result<RgbImage> {
        ImageBuffer::from_vec(self.width as u32, self.height as u32, self.pixels.clone())
            .ok_or_else(|| anyhow::anyhow!("Failed to create image buffer"))
    }
}

impl fmt::Display for Image {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:?}, Resolution: {}x{}",
            self.name, self.width, self.height
        )
    }
}

impl Default for Image {
    fn default() -> Self {
        Self {
            width: 0,
            height: 0,
            pixels: Vec::new(),
            name: None,
        }
    }
}

/// Pixel rectangle `[x_min, x_max) x [y_min, y_max)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct PixelRegion {
    pub x_min: u32,
    pub y_min: u32,
    pub x_max: u32,
    pub y_max: u32,
}

impl PixelRegion {
    pub fn width(&self) -> u32 {
        self.x_max.saturating_sub(self.x_min)
    }

    pub fn height(&self) -> u32 {
        self.y_max.saturating_sub(self.y_min)
    }

    pub fn clamp(&self, width: u32, height: u32) -> Self {
        let x_max = self.x_max.min(width);
        let y_max = self.y_max.min(height);
        Self {
            x_min: self.x_min.min(x_max),
            y_min: self.y_min.min(y_max),
            x_max,
            y_max,
        }
    }
}

pub fn decode_jpeg(name: Option<String>, jpeg: Bytes, image: &mut Image) -> anyhow::Result<()> {
    let options = DecoderOptions::default()
        .set_strict_mode(true)
        .set_use_unsafe(true)
        .jpeg_set_out_colorspace(ColorSpace::RGB);
    let mut decoder = JpegDecoder::new_with_options(jpeg.as_ref(), options);
    // Headers first, they carry the output buffer size
    decoder.decode_headers()?;
    let output_buffer_size = decoder
        .output_buffer_size()
        .ok_or_else(|| anyhow::anyhow!("Failed to get decoder output buffer size"))?;
    image.resize(output_buffer_size);
    decoder.decode_into(&mut image.pixels)?;
    let (width, height) = decoder
        .dimensions()
        .ok_or_else(|| anyhow::anyhow!("Failed to get image dimensions"))?;
    image.width = width;
    image.height = height;
    image.name = name;
    Ok(())
}

/// Decodes JPEG with zune-jpeg and everything else (PNG) with the image crate.
pub fn decode_image(name: Option<String>, bytes: Bytes, image: &mut Image) -> anyhow::Result<()> {
    if bytes.starts_with(&[0xFF, 0xD8]) {
        return decode_jpeg(name, bytes, image);
    }
    let rgb = image::load_from_memory(bytes.as_ref())?.to_rgb8();
    *image = Image::from_rgb(name, rgb);
    Ok(())
}

pub fn load_image(image_file: &Path) -> anyhow::Result<Bytes> {
    let Some(image_name) = image_file.to_str() else {
        bail!("Image path {:?} is not valid UTF-8", image_file)
    };
    if !is_supported_image(image_name) {
        bail!("Image {} is not a JPEG or PNG file", image_name)
    }
    Ok(Bytes::from(std::fs::read(image_file)?))
}

pub fn is_jpeg(image_name: &str) -> bool {
    let image_name = image_name.to_lowercase();
    image_name.ends_with(".jpg") || image_name.ends_with(".jpeg")
}

pub fn is_png(image_name: &str) -> bool {
    image_name.to_lowercase().ends_with(".png")
}

pub fn is_supported_image(image_name: &str) -> bool {
    is_jpeg(image_name) || is_png(image_name)
}

/// `bins/bin_01.png` -> `bin_01_annotated.jpg`
pub fn create_annotated_image_name(image_name: &str) -> anyhow::Result<String> {
    if !is_supported_image(image_name) {
        bail!("Image is not a JPEG or PNG file");
    }

    let file_name = Path::new(image_name)
        .file_stem()
        .ok_or_else(|| anyhow::anyhow!("Failed to strip path from image name"))?
        .to_str()
        .ok_or_else(|| anyhow::anyhow!("Failed to convert image name to string"))?;

    Ok(format!("{file_name}_annotated.jpg"))
}

/// Box drawn on an annotated image, `counted` boxes are green and the rest red.
pub struct AnnotatedBox {
    pub region: PixelRegion,
    pub counted: bool,
}

pub fn encode_and_save_annotated_jpeg(
    image: &Image,
    jpeg_file: &Path,
    boxes: &[AnnotatedBox],
) -> anyhow::Result<()> {
    let encode_image_start_time = Instant::now();

    let mut img = image.to_rgb_image()?;
    for annotated in boxes {
        let region = annotated.region.clamp(img.width(), img.height());
        if region.width() == 0 || region.height() == 0 {
            continue;
        }
        let color = if annotated.counted {
            image::Rgb([0, 200, 0])
        } else {
            image::Rgb([255, 0, 0])
        };
        // Two pixel border
        for inset in 0..2u32 {
            if region.width() <= inset * 2 || region.height() <= inset * 2 {
                break;
            }
            imageproc::drawing::draw_hollow_rect_mut(
                &mut img,
                imageproc::rect::Rect::at(
                    (region.x_min + inset) as i32,
                    (region.y_min + inset) as i32,
                )
                .of_size(region.width() - inset * 2, region.height() - inset * 2),
                color,
            );
        }
    }

    let encoder = Encoder::new_file(jpeg_file, 90)?;
    encoder.encode(
        img.as_raw(),
        img.width() as u16,
        img.height() as u16,
        ColorType::Rgb,
    )?;
    let encode_image_time = encode_image_start_time.elapsed();
    debug!(?encode_image_time, "Encode image time");
    info!(?jpeg_file, "Annotated image saved");
    Ok(())
}

pub struct Resizer {
    resizer: fast_image_resize::Resizer,
    target_width: usize,
    target_height: usize,
}

impl Default for Resizer {
    fn default() -> Self {
        Self {
            resizer: fast_image_resize::Resizer::new(),
            target_width: 640,
            target_height: 640,
        }
    }
}

impl Resizer {
    pub fn new(target_width: usize, target_height: usize) -> Self {
        Self {
            resizer: fast_image_resize::Resizer::new(),
            target_width,
            target_height,
        }
    }

    pub fn resize_image(
        &mut self,
        original_image: &Image,
        resized_image: &mut Image,
    ) -> anyhow::Result<()> {
        debug!(
            "Resizing image from {}x{} to {}x{}",
            original_image.width, original_image.height, self.target_width, self.target_height
        );
        let src_image = fast_image_resize::images::ImageRef::new(
            original_image.width as u32,
            original_image.height as u32,
            &original_image.pixels,
            fast_image_resize::PixelType::U8x3,
        )?;

        resized_image.width = self.target_width;
        resized_image.height = self.target_height;
        resized_image.resize(self.target_width * self.target_height * 3);

        let mut dst_image = fast_image_resize::images::Image::from_slice_u8(
            resized_image.width as u32,
            resized_image.height as u32,
            &mut resized_image.pixels,
            fast_image_resize::PixelType::U8x3,
        )?;

        self.resizer.resize(&src_image, &mut dst_image, None)?;

        Ok(())
    }
}
