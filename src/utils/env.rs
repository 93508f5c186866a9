/// Splits a size such as `64m`, `1.5G` or `512kb` into its number and unit factor.
fn read_float_and_factor(value: &str) -> Option<(f64, usize)> {
    let mut value = value.trim();
    if value.is_empty() {
        return None;
    }
    if value.len() > 1 && (value.ends_with('b') || value.ends_with('B')) {
        value = &value[..value.len() - 1];
    }

    let (digits, factor) = match value.as_bytes()[value.len() - 1] {
        b'g' | b'G' => (&value[..value.len() - 1], 1024 * 1024 * 1024),
        b'm' | b'M' => (&value[..value.len() - 1], 1024 * 1024),
        b'k' | b'K' => (&value[..value.len() - 1], 1024),
        _ => (value, 1),
    };

    match digits.parse::<f64>() {
        Ok(x) if x.is_finite() && x >= 0.0 => Some((x, factor)),
        _ => None,
    }
}

fn read_float_and_factor_from_env(var: &str) -> Option<(f64, usize)> {
    let value = std::env::var(var).ok()?;
    read_float_and_factor(&value)
}

pub fn read_uint_from_str(value: &str) -> Option<usize> {
    let (value, factor) = read_float_and_factor(value)?;

    Some((value * factor as f64) as usize)
}

pub fn read_uint_from_env(var: &str) -> Option<usize> {
    let (value, factor) = read_float_and_factor_from_env(var)?;

    Some((value * factor as f64) as usize)
}

pub fn read_float_from_env(var: &str) -> Option<f64> {
    read_float_and_factor_from_env(var).map(|x| x.0)
}
