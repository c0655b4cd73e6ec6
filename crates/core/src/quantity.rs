//! Orchestrator quantity strings (`500m`, `2`, `128Mi`, `1G`, `1e3`).

/// Splits a quantity into its numeric part and multiplier.
fn split(q: &str) -> Option<(f64, f64)> {
    let q = q.trim();
    if q.is_empty() {
        return None;
    }
    const BINARY: [(&str, f64); 6] = [
        ("Ki", 1024.0),
        ("Mi", 1_048_576.0),
        ("Gi", 1_073_741_824.0),
        ("Ti", 1_099_511_627_776.0),
        ("Pi", 1_125_899_906_842_624.0),
        ("Ei", 1_152_921_504_606_846_976.0),
    ];
    for (suffix, mult) in BINARY {
        if let Some(num) = q.strip_suffix(suffix) {
            return num.parse::<f64>().ok().map(|n| (n, mult));
        }
    }
    let (num, mult) = match q.as_bytes()[q.len() - 1] {
        b'n' => (&q[..q.len() - 1], 1e-9),
        b'u' => (&q[..q.len() - 1], 1e-6),
        b'm' => (&q[..q.len() - 1], 1e-3),
        b'k' => (&q[..q.len() - 1], 1e3),
        b'M' => (&q[..q.len() - 1], 1e6),
        b'G' => (&q[..q.len() - 1], 1e9),
        b'T' => (&q[..q.len() - 1], 1e12),
        b'P' => (&q[..q.len() - 1], 1e15),
        // `E` alone is exa; `1e3`/`1E3` exponent forms parse as plain floats below.
        b'E' if q[..q.len() - 1].parse::<f64>().is_ok() => (&q[..q.len() - 1], 1e18),
        _ => (q, 1.0),
    };
    let n = num.parse::<f64>().ok()?;
    n.is_finite().then_some((n, mult))
}

/// CPU in millicores. `None` for unparsable input.
pub fn parse_cpu_millis(q: &str) -> Option<i64> {
    let (n, mult) = split(q)?;
    Some((n * mult * 1000.0).ceil() as i64)
}

/// Memory in bytes. `None` for unparsable input.
pub fn parse_memory_bytes(q: &str) -> Option<i64> {
    let (n, mult) = split(q)?;
    Some((n * mult).ceil() as i64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cpu_forms() {
        assert_eq!(parse_cpu_millis("500m"), Some(500));
        assert_eq!(parse_cpu_millis("2"), Some(2000));
        assert_eq!(parse_cpu_millis("0.25"), Some(250));
        assert_eq!(parse_cpu_millis("1e3m"), Some(1000));
        assert_eq!(parse_cpu_millis(""), None);
        assert_eq!(parse_cpu_millis("lots"), None);
    }

    #[test]
    fn memory_forms() {
        assert_eq!(parse_memory_bytes("128Mi"), Some(134_217_728));
        assert_eq!(parse_memory_bytes("1G"), Some(1_000_000_000));
        assert_eq!(parse_memory_bytes("1k"), Some(1000));
        assert_eq!(parse_memory_bytes("1e3"), Some(1000));
        assert_eq!(parse_memory_bytes("2Ki"), Some(2048));
    }
}
