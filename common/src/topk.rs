use std::{
    cmp::{Ordering, Reverse},
    collections::BinaryHeap,
};

use crate::color::{ColorHistogram, ColorKey};

pub const TOP_K: usize = 3;

/// Hasta 3 colores, del más frecuente al menos frecuente.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct TopColors {
    colors: Vec<ColorKey>,
}

impl TopColors {
    pub fn keys(&self) -> &[ColorKey] {
        &self.colors
    }

    pub fn len(&self) -> usize {
        self.colors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.colors.is_empty()
    }

    /// Códigos `#RRGGBB` en orden.
    pub fn hex_codes(&self) -> Vec<String> {
        self.colors.iter().map(ColorKey::to_hex).collect()
    }

    /// Las 3 columnas del CSV; las que faltan quedan vacías.
    pub fn columns(&self) -> [String; TOP_K] {
        let mut cols: [String; TOP_K] = Default::default();
        for (slot, key) in cols.iter_mut().zip(self.colors.iter()) {
            *slot = key.to_hex();
        }
        cols
    }
}

/// Entrada del heap. "Mayor" significa mejor puesto:
/// más conteo, y a igual conteo, el color lexicográficamente menor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Ranked {
    count: u64,
    key: ColorKey,
}

impl Ord for Ranked {
    fn cmp(&self, other: &Self) -> Ordering {
        self.count
            .cmp(&other.count)
            .then_with(|| other.key.cmp(&self.key))
    }
}

impl PartialOrd for Ranked {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Los 3 colores más frecuentes del histograma.
pub fn top_colors(hist: &ColorHistogram) -> TopColors {
    top_k(hist, TOP_K)
}

/// Selección parcial con un min-heap acotado a `k`: O(n log k).
pub fn top_k(hist: &ColorHistogram, k: usize) -> TopColors {
    if k == 0 {
        return TopColors::default();
    }

    let mut heap: BinaryHeap<Reverse<Ranked>> = BinaryHeap::with_capacity(k + 1);

    for (key, count) in hist.iter() {
        heap.push(Reverse(Ranked {
            count: *count,
            key: *key,
        }));
        if heap.len() > k {
            // sale el peor de los k+1
            heap.pop();
        }
    }

    // into_sorted_vec de Reverse deja primero al mejor
    let colors = heap
        .into_sorted_vec()
        .into_iter()
        .map(|Reverse(r)| r.key)
        .collect();

    TopColors { colors }
}
