//! Number formatting shared by digests and alerts.

/// Compact human format: "1.50M", "1,000.00", "0.5000".
pub fn format_num(v: f64) -> String {
    if v.abs() >= 1_000_000.0 {
        format!("{:.2}M", v / 1_000_000.0)
    } else if v.abs() >= 1_000.0 {
        add_commas(v)
    } else {
        format!("{:.4}", v)
    }
}

/// Two decimals with thousands separators: 1234567.891 -> "1,234,567.89".
pub fn add_commas(v: f64) -> String {
    let fixed = format!("{:.2}", v.abs());
    let (int_part, frac_part) = fixed.split_once('.').unwrap_or((fixed.as_str(), "00"));

    let mut grouped = String::with_capacity(int_part.len() + int_part.len() / 3);
    for (i, c) in int_part.chars().enumerate() {
        if i > 0 && (int_part.len() - i) % 3 == 0 {
            grouped.push(',');
        }
        grouped.push(c);
    }

    let sign = if v < 0.0 { "-" } else { "" };
    format!("{}{}.{}", sign, grouped, frac_part)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_num() {
        assert_eq!(format_num(1000.0), "1,000.00");
        assert_eq!(format_num(1_500_000.0), "1.50M");
        assert_eq!(format_num(0.5), "0.5000");
        assert_eq!(format_num(999.99), "999.9900");
    }

    #[test]
    fn test_add_commas() {
        assert_eq!(add_commas(1_234_567.891), "1,234,567.89");
        assert_eq!(add_commas(100.0), "100.00");
        assert_eq!(add_commas(-12_345.0), "-12,345.00");
    }
}
