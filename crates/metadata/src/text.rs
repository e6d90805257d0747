//! Text folding and number parsing shared by every stage that compares
//! labels or reads numbers out of the extracts.

use unicode_normalization::char::is_combining_mark;
use unicode_normalization::UnicodeNormalization;

/// Canonical decomposition with the combining marks dropped, so precomposed
/// (`"São"`) and decomposed (`"Sa\u{303}o"`) spellings fold alike.
fn strip_accents(s: &str) -> impl Iterator<Item = char> + '_ {
    s.nfd().filter(|c| !is_combining_mark(*c))
}

/// Column-name key: lowercase, accents stripped, whitespace runs become `_`.
/// `"Número do Contribuinte"` and `numero_do_contribuinte` fold to the same key.
pub fn fold_header(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    let mut pending_sep = false;
    for c in strip_accents(name.trim()) {
        if c.is_whitespace() || c == '_' {
            pending_sep = !out.is_empty();
            continue;
        }
        if pending_sep {
            out.push('_');
            pending_sep = false;
        }
        out.extend(c.to_lowercase());
    }
    out
}

/// Categorical key: trimmed, whitespace collapsed, accents stripped, upper-case.
/// Returns `None` for blank input.
pub fn fold_label(value: &str) -> Option<String> {
    let mut out = String::with_capacity(value.len());
    for word in value.split_whitespace() {
        if !out.is_empty() {
            out.push(' ');
        }
        out.extend(strip_accents(word).flat_map(char::to_uppercase));
    }
    if out.is_empty() {
        None
    } else {
        Some(out)
    }
}

/// Parses amounts as they appear across the yearly extracts
/// (`"R$ 1.234,56"`, `"1,234.56"`, `"1234.5"`, `"1.234.567"`).
///
/// A lone `,` or `.` is the decimal separator, a repeated one groups thousands,
/// and when both occur the last one is the decimal separator.
pub fn parse_number(raw: &str) -> Option<f64> {
    let cleaned: String = raw
        .trim()
        .trim_start_matches("R$")
        .chars()
        .filter(|c| !c.is_whitespace())
        .collect();
    if cleaned.is_empty() {
        return None;
    }

    let commas = cleaned.matches(',').count();
    let dots = cleaned.matches('.').count();
    let normalized = match (commas, dots) {
        (0, 0) => cleaned,
        (c, 0) if c > 1 => cleaned.replace(',', ""),
        (_, 0) => cleaned.replace(',', "."),
        (0, d) if d > 1 => cleaned.replace('.', ""),
        (0, _) => cleaned,
        _ => {
            let last_comma = cleaned.rfind(',');
            let last_dot = cleaned.rfind('.');
            if last_comma > last_dot {
                cleaned.replace('.', "").replace(',', ".")
            } else {
                cleaned.replace(',', "")
            }
        }
    };

    normalized.parse::<f64>().ok().filter(|v| v.is_finite())
}

/// Whole numbers, tolerating the `"1990.0"` spelling spreadsheets produce.
pub fn parse_whole(raw: &str) -> Option<i64> {
    let v = parse_number(raw)?;
    if v.fract() != 0.0 || v.abs() > i64::MAX as f64 {
        return None;
    }
    Some(v as i64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn headers_fold_across_spellings() {
        assert_eq!(fold_header("Número do Contribuinte"), "numero_do_contribuinte");
        assert_eq!(fold_header("  ANO  DO_EXERCÍCIO "), "ano_do_exercicio");
        assert_eq!(fold_header("valor_total"), "valor_total");
    }

    #[test]
    fn labels_fold_to_upper_ascii() {
        assert_eq!(fold_label("  boa   vista "), Some("BOA VISTA".to_string()));
        assert_eq!(fold_label("São José"), Some("SAO JOSE".to_string()));
        assert_eq!(fold_label("   "), None);
    }

    #[test]
    fn decomposed_input_folds_like_precomposed() {
        assert_eq!(fold_label("Sa\u{303}o Jose\u{301}"), Some("SAO JOSE".to_string()));
        assert_eq!(fold_header("Nu\u{301}mero do Contribuinte"), "numero_do_contribuinte");
        assert_eq!(fold_label("Peña Ýbor"), Some("PENA YBOR".to_string()));
    }

    #[test]
    fn numbers_in_local_and_plain_formats() {
        assert_eq!(parse_number("R$ 1.234,56"), Some(1234.56));
        assert_eq!(parse_number("1,234.56"), Some(1234.56));
        assert_eq!(parse_number("1234,5"), Some(1234.5));
        assert_eq!(parse_number("1.234.567"), Some(1_234_567.0));
        assert_eq!(parse_number("-1"), Some(-1.0));
        assert_eq!(parse_number("abc"), None);
        assert_eq!(parse_number(""), None);
    }

    #[test]
    fn whole_numbers_reject_fractions() {
        assert_eq!(parse_whole("1990.0"), Some(1990));
        assert_eq!(parse_whole("1990"), Some(1990));
        assert_eq!(parse_whole("1990.5"), None);
    }
}
