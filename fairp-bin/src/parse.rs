use anyhow::{Result, anyhow, bail};

/// Parse a byte count with an optional binary unit suffix
///
/// `K`, `M` and `G` stand for KiB, MiB and GiB; a trailing `B` or `iB` is
/// ignored, so `10M`, `10MB` and `10MiB` are the same. Fractions are
/// allowed (`1.5M`).
pub(crate) fn parse_byte_count(input: &str) -> Result<f64> {
    let trimmed = input.trim();
    let lower = trimmed.to_ascii_lowercase();
    let without_bytes = lower
        .strip_suffix("ib")
        .or_else(|| lower.strip_suffix('b'))
        .unwrap_or(&lower);

    let (number, multiplier) = match without_bytes.chars().last() {
        Some('k') => (&without_bytes[..without_bytes.len() - 1], 1024.0),
        Some('m') => (&without_bytes[..without_bytes.len() - 1], 1024.0 * 1024.0),
        Some('g') => (
            &without_bytes[..without_bytes.len() - 1],
            1024.0 * 1024.0 * 1024.0,
        ),
        _ => (without_bytes, 1.0),
    };

    let value: f64 = number
        .trim()
        .parse()
        .map_err(|_| anyhow!("Invalid byte count `{trimmed}`, expected e.g. `512K` or `10M`"))?;
    if !value.is_finite() || value < 0.0 {
        bail!("Byte count must be a non-negative number, got `{trimmed}`");
    }
    Ok(value * multiplier)
}
