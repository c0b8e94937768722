use std::sync::LazyLock;

use regex::Regex;

/// Sheet numbers such as `A-101`, `S2.01`, `M101` or `FP-3.10`.
static RE_SHEET_NUMBER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b([A-Z]{1,2})(-?)(\d{1,3}(?:\.\d{1,3})?)\b").unwrap());

/// Minimum digits in a sheet number; keeps `A1` or `B-2` grid labels out.
const MIN_DIGITS: usize = 3;

/// Finds the first sheet number in `text`.
pub fn find_sheet_number(text: &str) -> Option<String> {
    RE_SHEET_NUMBER.captures_iter(text).find_map(|caps| {
        let number = &caps[3];
        let digits = number.chars().filter(char::is_ascii_digit).count();
        (digits >= MIN_DIGITS).then(|| format!("{}{}{}", &caps[1], &caps[2], number))
    })
}

/// Name for a page: a sheet number from its text, else the file stem of a
/// single-page source, else `Sheet <n>`.
pub fn infer_sheet_name(
    text: Option<&str>,
    file_stem: Option<&str>,
    page_number: u32,
    single_page: bool,
) -> String {
    if let Some(number) = text.and_then(find_sheet_number) {
        return number;
    }
    match file_stem {
        Some(stem) if single_page && !stem.trim().is_empty() => stem.trim().to_string(),
        _ => format!("Sheet {}", page_number),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_common_sheet_numbers() {
        assert_eq!(find_sheet_number("FLOOR PLAN A-101 LEVEL 1"), Some("A-101".to_string()));
        assert_eq!(find_sheet_number("sheet S2.01 framing"), Some("S2.01".to_string()));
        assert_eq!(find_sheet_number("M101"), Some("M101".to_string()));
    }

    #[test]
    fn test_grid_labels_are_ignored() {
        assert_eq!(find_sheet_number("GRID A1 TO B-2, SEE E-201"), Some("E-201".to_string()));
        assert_eq!(find_sheet_number("no numbers here"), None);
    }

    #[test]
    fn test_fallbacks() {
        assert_eq!(infer_sheet_name(None, Some("lobby"), 1, true), "lobby");
        assert_eq!(infer_sheet_name(None, Some("set"), 4, false), "Sheet 4");
        assert_eq!(infer_sheet_name(Some("A-301"), Some("set"), 4, false), "A-301");
        assert_eq!(infer_sheet_name(Some(""), None, 2, true), "Sheet 2");
    }
}
