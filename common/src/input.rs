use std::{
    collections::HashSet,
    fs::File,
    io::{BufRead, BufReader},
    path::Path,
};

use crate::error::SetupError;

/// Lee el archivo de URLs, una por línea.
/// Se ignoran las líneas vacías y las URLs repetidas (gana la primera).
pub fn read_urls(path: impl AsRef<Path>) -> Result<Vec<String>, SetupError> {
    let path = path.as_ref();
    let input_err = |source| SetupError::Input {
        path: path.to_path_buf(),
        source,
    };

    let file = File::open(path).map_err(input_err)?;
    let reader = BufReader::new(file);

    let mut lines = Vec::new();
    for line in reader.lines() {
        lines.push(line.map_err(input_err)?);
    }

    Ok(dedupe_urls(lines))
}

/// Limpia una secuencia de URLs preservando el orden de la primera aparición.
pub fn dedupe_urls<I>(lines: I) -> Vec<String>
where
    I: IntoIterator,
    I::Item: AsRef<str>,
{
    let mut seen: HashSet<String> = HashSet::new();
    let mut out = Vec::new();

    for line in lines {
        // Limpia BOM por si viene de Windows
        let url = line.as_ref().trim().trim_start_matches('\u{feff}');
        if url.is_empty() {
            continue;
        }
        if seen.insert(url.to_string()) {
            out.push(url.to_string());
        }
    }

    out
}
