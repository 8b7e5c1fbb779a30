//! Contains a collection of useful utility functions.

use std::fs::{self, read};
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};
use crate::Float;

/// Create a static deser object from given path using serde.
pub fn deser_struct_from_path<T>(file_path: &Path) -> Result<T>
where
    for<'de> T: serde::Deserialize<'de>,
{
    let bytes = read(file_path)?;
    let extension = file_path
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or_default();
    let d: T = match extension {
        "toml" => toml::from_slice(&bytes)?,
        #[cfg(feature = "yaml")]
        "yaml" | "yml" => serde_yaml::from_slice(&bytes)?,
        _ => {
            return Err(Error::InvalidConfiguration(format!(
                "unsupported configuration file format: {}",
                file_path.display()
            )))
        }
    };
    Ok(d)
}

/// Get a similar name based on string similarity.
pub fn get_similar(original: &str, list: &[&str]) -> Option<String> {
    use strsim::normalized_damerau_levenshtein;
    let mut highest_sim = 0f64;
    let mut best = None;
    for candidate in list {
        let sim = normalized_damerau_levenshtein(candidate, original);
        if sim > highest_sim {
            highest_sim = sim;
            best = Some(candidate);
        }
    }
    if highest_sim > 0.4f64 {
        best.map(|s| s.to_string())
    } else {
        None
    }
}

/// Makes the path absolute against `base` if it's relative.
pub fn absolute(base: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        base.join(path)
    }
}

/// Recursively copies the directory `from` into `to`, creating it.
pub fn copy_dir(from: &Path, to: &Path) -> Result<()> {
    fs::create_dir_all(to)?;
    for entry in fs::read_dir(from)? {
        let entry = entry?;
        let target = to.join(entry.file_name());
        if entry.file_type()?.is_dir() {
            copy_dir(&entry.path(), &target)?;
        } else {
            fs::copy(entry.path(), target)?;
        }
    }
    Ok(())
}

/// Lists all files under the given directory, recursively.
pub fn files_in(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        if path.is_dir() {
            files.extend(files_in(&path)?);
        } else {
            files.push(path);
        }
    }
    Ok(files)
}

/// Replaces `{name}` placeholders in `text` using `lookup`.
///
/// `{{` and `}}` produce literal braces. Placeholders for which `lookup`
/// returns `None` are left untouched, unless `strict` is set in which case
/// the first one is returned as an error.
pub fn substitute<F>(text: &str, lookup: F, strict: bool) -> std::result::Result<String, String>
where
    F: Fn(&str) -> Option<String>,
{
    let mut out = String::with_capacity(text.len());
    let mut rest = text;
    while let Some(pos) = rest.find(|c| c == '{' || c == '}') {
        out.push_str(&rest[..pos]);
        let tail = &rest[pos..];
        if tail.starts_with("{{") {
            out.push('{');
            rest = &tail[2..];
        } else if tail.starts_with("}}") {
            out.push('}');
            rest = &tail[2..];
        } else if tail.starts_with('}') {
            out.push('}');
            rest = &tail[1..];
        } else {
            match tail[1..].find(|c| c == '}' || c == '{' || c == '\n') {
                Some(end) if tail[1..].as_bytes()[end] == b'}' && is_placeholder(&tail[1..end + 1]) => {
                    let name = &tail[1..end + 1];
                    match lookup(name) {
                        Some(value) => out.push_str(&value),
                        None if strict => return Err(name.to_string()),
                        None => out.push_str(&tail[..end + 2]),
                    }
                    rest = &tail[end + 2..];
                }
                _ => {
                    out.push('{');
                    rest = &tail[1..];
                }
            }
        }
    }
    out.push_str(rest);
    Ok(out)
}

fn is_placeholder(name: &str) -> bool {
    !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_alphanumeric() || c == '_' || c == '.' || c == '-')
}

/// `n` evenly spaced values over `[a, b]`.
pub fn linspace(a: Float, b: Float, n: usize) -> Vec<Float> {
    match n {
        0 => Vec::new(),
        1 => vec![a],
        _ => (0..n)
            .map(|i| a + (b - a) * i as Float / (n - 1) as Float)
            .collect(),
    }
}

/// Error function, Abramowitz and Stegun formula 7.1.26 (absolute error
/// below 1.5e-7).
pub fn erf(x: Float) -> Float {
    let sign = if x < 0. { -1. } else { 1. };
    let x = x.abs();
    let t = 1. / (1. + 0.3275911 * x);
    let y = 1.
        - (((((1.061405429 * t - 1.453152027) * t) + 1.421413741) * t - 0.284496736) * t
            + 0.254829592)
            * t
            * (-x * x).exp();
    sign * y
}

/// Standard normal cumulative distribution function.
pub fn norm_cdf(x: Float) -> Float {
    0.5 * (1. + erf(x / std::f64::consts::SQRT_2))
}

/// Standard normal probability density function.
pub fn norm_pdf(x: Float) -> Float {
    (-0.5 * x * x).exp() / (2. * std::f64::consts::PI).sqrt()
}

/// Euclidean distance between two points.
pub fn distance(a: &[Float], b: &[Float]) -> Float {
    a.iter()
        .zip(b.iter())
        .map(|(x, y)| (x - y) * (x - y))
        .sum::<Float>()
        .sqrt()
}

#[test]
fn substitute_fills_known_and_keeps_unknown() {
    let lookup = |name: &str| match name {
        "u" => Some("1.5".to_string()),
        _ => None,
    };
    assert_eq!(
        substitute("u = {u}, v = {v}", lookup, false).unwrap(),
        "u = 1.5, v = {v}"
    );
    assert_eq!(substitute("{{u}} {u}", lookup, false).unwrap(), "{u} 1.5");
    assert_eq!(
        substitute("fn() { return {u}; }", lookup, false).unwrap(),
        "fn() { return 1.5; }"
    );
    assert_eq!(substitute("{v}", lookup, true), Err("v".to_string()));
}

#[test]
fn normal_helpers_are_accurate() {
    assert!((erf(0.5) - 0.5204998778).abs() < 1e-6);
    assert!((norm_cdf(0.) - 0.5).abs() < 1e-9);
    assert!((norm_cdf(1.96) - 0.9750021).abs() < 1e-6);
    assert!((norm_pdf(0.) - 0.3989422804).abs() < 1e-9);
}

#[test]
fn linspace_includes_both_ends() {
    assert_eq!(linspace(0., 1., 3), vec![0., 0.5, 1.]);
    assert_eq!(linspace(2., 3., 1), vec![2.]);
}
