use std::{collections::HashMap, fmt};

use image::RgbImage;

/// Color exacto de un pixel. El orden derivado es lexicográfico (r, g, b),
/// y es el que se usa para desempatar en el top-k.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ColorKey {
    pub r: u8,
    pub g: u8,
    pub b: u8,
}

impl ColorKey {
    pub const fn new(r: u8, g: u8, b: u8) -> Self {
        Self { r, g, b }
    }

    /// `#RRGGBB` en hexadecimal mayúscula.
    pub fn to_hex(&self) -> String {
        format!("#{:02X}{:02X}{:02X}", self.r, self.g, self.b)
    }
}

impl fmt::Display for ColorKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl From<image::Rgb<u8>> for ColorKey {
    fn from(px: image::Rgb<u8>) -> Self {
        let [r, g, b] = px.0;
        Self { r, g, b }
    }
}

/// Cómo se recorre la imagen.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ScanMode {
    /// Cada pixel se cuenta exactamente una vez.
    #[default]
    Full,
    /// Se toma un pixel cada `stride` por fila; sólo se refina
    /// el tramo entre dos muestras distintas.
    Sampled { stride: u32 },
}

/// Si los conteos del histograma son exactos o estimados.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CountMode {
    Exact,
    Estimated { stride: u32 },
}

impl CountMode {
    pub fn is_exact(&self) -> bool {
        matches!(self, CountMode::Exact)
    }
}

/// Histograma de una sola imagen, propiedad del worker que lo construye.
#[derive(Debug, Clone)]
pub struct ColorHistogram {
    counts: HashMap<ColorKey, u64>,
    mode: CountMode,
}

impl ColorHistogram {
    pub fn new(mode: CountMode) -> Self {
        Self {
            counts: HashMap::new(),
            mode,
        }
    }

    pub fn add(&mut self, key: ColorKey, n: u64) {
        if n > 0 {
            *self.counts.entry(key).or_insert(0) += n;
        }
    }

    pub fn get(&self, key: &ColorKey) -> u64 {
        self.counts.get(key).copied().unwrap_or(0)
    }

    /// Cantidad de colores distintos.
    pub fn len(&self) -> usize {
        self.counts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.counts.is_empty()
    }

    /// Suma de todos los conteos.
    pub fn total(&self) -> u64 {
        self.counts.values().sum()
    }

    pub fn mode(&self) -> CountMode {
        self.mode
    }

    pub fn iter(&self) -> impl Iterator<Item = (&ColorKey, &u64)> {
        self.counts.iter()
    }
}

impl FromIterator<(ColorKey, u64)> for ColorHistogram {
    fn from_iter<I: IntoIterator<Item = (ColorKey, u64)>>(iter: I) -> Self {
        let mut hist = ColorHistogram::new(CountMode::Exact);
        for (key, n) in iter {
            hist.add(key, n);
        }
        hist
    }
}

/// Cuenta los colores de una imagen ya decodificada.
///
/// En modo `Full` la suma de conteos es siempre `width * height`.
/// En modo `Sampled` cada pixel también se atribuye una sola vez, pero los
/// tramos entre dos muestras iguales se asumen de ese color, así que los
/// conteos por color son una estimación (lo indica `CountMode::Estimated`).
pub fn count_colors(img: &RgbImage, scan: ScanMode) -> ColorHistogram {
    count_colors_until(img, scan, || false)
        .unwrap_or_else(|| ColorHistogram::new(CountMode::Exact))
}

/// Como [`count_colors`], pero consulta `stop` al empezar cada fila y
/// abandona el conteo (devuelve `None`) en cuanto pide cortar.
pub fn count_colors_until(
    img: &RgbImage,
    scan: ScanMode,
    stop: impl Fn() -> bool,
) -> Option<ColorHistogram> {
    match scan {
        ScanMode::Sampled { stride } if stride > 1 => count_sampled(img, stride, &stop),
        _ => count_full(img, &stop),
    }
}

fn count_full(img: &RgbImage, stop: &impl Fn() -> bool) -> Option<ColorHistogram> {
    let mut hist = ColorHistogram::new(CountMode::Exact);
    for row in img.rows() {
        if stop() {
            return None;
        }
        for px in row {
            hist.add(ColorKey::from(*px), 1);
        }
    }
    Some(hist)
}

fn count_sampled(
    img: &RgbImage,
    stride: u32,
    stop: &impl Fn() -> bool,
) -> Option<ColorHistogram> {
    let mut hist = ColorHistogram::new(CountMode::Estimated { stride });
    let (width, height) = img.dimensions();
    if width == 0 || height == 0 {
        return Some(hist);
    }

    for y in 0..height {
        if stop() {
            return None;
        }
        let mut x = 0u32;
        let mut prev = ColorKey::from(*img.get_pixel(0, y));
        hist.add(prev, 1);

        while x < width - 1 {
            let next = (x + stride).min(width - 1);
            let sample = ColorKey::from(*img.get_pixel(next, y));

            if sample == prev {
                // mismo color en ambos extremos: se asume el tramo completo
                hist.add(sample, (next - x) as u64);
            } else {
                // hay un borde en el tramo, se cuenta pixel a pixel
                for xi in (x + 1)..=next {
                    hist.add(ColorKey::from(*img.get_pixel(xi, y)), 1);
                }
            }

            x = next;
            prev = sample;
        }
    }

    Some(hist)
}
