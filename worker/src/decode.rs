use std::io::Cursor;

use common::TaskError;
use image::{
    codecs::{jpeg::JpegDecoder, png::PngDecoder},
    io::Reader as ImageReader,
    ImageDecoder, ImageFormat, RgbImage,
};

/// Bytes por pixel de la copia RGB8 que se cuenta.
pub const RGB8_BYTES_PER_PIXEL: u64 = 3;

/// Peor caso del buffer nativo: RGBA con canales f32.
pub const MAX_NATIVE_BYTES_PER_PIXEL: u64 = 16;

fn reader(bytes: &[u8]) -> Result<ImageReader<Cursor<&[u8]>>, TaskError> {
    ImageReader::new(Cursor::new(bytes))
        .with_guessed_format()
        .map_err(|e| TaskError::Decode(e.to_string()))
}

/// Lee sólo el encabezado para conocer ancho y alto.
pub fn probe_dimensions(bytes: &[u8]) -> Result<(u32, u32), TaskError> {
    reader(bytes)?
        .into_dimensions()
        .map_err(|e| TaskError::Decode(e.to_string()))
}

/// Rechaza imágenes demasiado grandes antes de decodificarlas.
/// Devuelve la cantidad de pixeles.
pub fn check_limits(width: u32, height: u32, max_pixels: u64) -> Result<u64, TaskError> {
    let pixels = u64::from(width) * u64::from(height);
    if pixels > max_pixels {
        return Err(TaskError::SizeLimit(format!(
            "imagen de {}x{} ({} pixeles), máximo {}",
            width, height, pixels, max_pixels
        )));
    }
    Ok(pixels)
}

/// Memoria que ocupa decodificar: el buffer nativo del decoder más la
/// copia RGB8. El nativo sale del tipo de color del encabezado cuando el
/// formato lo permite (PNG de 16 bits ocupa el doble que uno de 8).
pub fn estimate_decoded_bytes(bytes: &[u8], width: u32, height: u32) -> u64 {
    let pixels = u64::from(width) * u64::from(height);
    let format = reader(bytes).ok().and_then(|r| r.format());
    native_bytes(bytes, format, pixels).saturating_add(pixels * RGB8_BYTES_PER_PIXEL)
}

fn native_bytes(bytes: &[u8], format: Option<ImageFormat>, pixels: u64) -> u64 {
    let exact = match format {
        Some(ImageFormat::Png) => PngDecoder::new(Cursor::new(bytes))
            .ok()
            .map(|d| d.total_bytes()),
        Some(ImageFormat::Jpeg) => JpegDecoder::new(Cursor::new(bytes))
            .ok()
            .map(|d| d.total_bytes()),
        _ => None,
    };
    exact.unwrap_or_else(|| pixels.saturating_mul(native_bytes_per_pixel(format)))
}

fn native_bytes_per_pixel(format: Option<ImageFormat>) -> u64 {
    match format {
        // 8 bits por canal, a lo sumo RGBA
        Some(ImageFormat::Gif | ImageFormat::Bmp | ImageFormat::WebP) => 4,
        _ => MAX_NATIVE_BYTES_PER_PIXEL,
    }
}

/// Decodifica a RGB8. El canal alfa se descarta.
pub fn decode_rgb(bytes: &[u8]) -> Result<RgbImage, TaskError> {
    let img = reader(bytes)?
        .decode()
        .map_err(|e| TaskError::Decode(e.to_string()))?;
    Ok(img.into_rgb8())
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{DynamicImage, ImageBuffer, ImageOutputFormat, Rgb, Rgba, RgbaImage};

    fn png_bytes(img: DynamicImage) -> Vec<u8> {
        let mut buf = Vec::new();
        img.write_to(&mut Cursor::new(&mut buf), ImageOutputFormat::Png)
            .unwrap();
        buf
    }

    #[test]
    fn probe_lee_dimensiones_sin_decodificar() {
        let bytes = png_bytes(DynamicImage::ImageRgb8(RgbImage::new(7, 3)));
        assert_eq!(probe_dimensions(&bytes).unwrap(), (7, 3));
    }

    #[test]
    fn bytes_basura_son_error_de_decode() {
        let err = probe_dimensions(b"esto no es una imagen").unwrap_err();
        assert_eq!(err.reason(), "decode");

        let err = decode_rgb(b"\x89PNG\r\n\x1a\n roto").unwrap_err();
        assert_eq!(err.reason(), "decode");
    }

    #[test]
    fn check_limits_rechaza_por_pixeles() {
        assert_eq!(check_limits(10, 10, 100).unwrap(), 100);
        let err = check_limits(10, 11, 100).unwrap_err();
        assert_eq!(err.reason(), "size_limit");
    }

    #[test]
    fn decode_rgb_descarta_alfa() {
        let rgba = RgbaImage::from_pixel(2, 1, Rgba([10, 20, 30, 0]));
        let bytes = png_bytes(DynamicImage::ImageRgba8(rgba));

        let img = decode_rgb(&bytes).unwrap();
        assert_eq!(img.dimensions(), (2, 1));
        assert_eq!(*img.get_pixel(1, 0), Rgb([10, 20, 30]));
    }

    #[test]
    fn estimacion_de_png_rgb8() {
        let bytes = png_bytes(DynamicImage::ImageRgb8(RgbImage::new(10, 10)));
        // nativo RGB8 + copia RGB8
        assert_eq!(estimate_decoded_bytes(&bytes, 10, 10), 100 * (3 + 3));
    }

    #[test]
    fn estimacion_de_png_rgba16_cuenta_ocho_bytes_nativos() {
        let img = ImageBuffer::from_pixel(100, 100, Rgba([1u16, 2, 3, 4]));
        let bytes = png_bytes(DynamicImage::ImageRgba16(img));

        assert_eq!(estimate_decoded_bytes(&bytes, 100, 100), 100 * 100 * (8 + 3));
    }

    #[test]
    fn estimacion_de_jpeg() {
        let mut bytes = Vec::new();
        DynamicImage::ImageRgb8(RgbImage::new(8, 8))
            .write_to(&mut Cursor::new(&mut bytes), ImageOutputFormat::Jpeg(90))
            .unwrap();
        assert_eq!(estimate_decoded_bytes(&bytes, 8, 8), 64 * (3 + 3));
    }

    #[test]
    fn estimacion_sin_formato_conocido_usa_el_peor_caso() {
        assert_eq!(
            estimate_decoded_bytes(b"????", 10, 10),
            100 * (MAX_NATIVE_BYTES_PER_PIXEL + RGB8_BYTES_PER_PIXEL)
        );
        assert_eq!(estimate_decoded_bytes(b"????", 0, 100), 0);
    }
}
