/// Normalise a user-supplied ticker: trims quotes and whitespace, drops an
/// exchange prefix such as `HOSE:` and uppercases the rest.
pub fn normalize_symbol(raw: &str) -> Option<String> {
    let trimmed = raw.trim().trim_matches(|c| c == '"' || c == '\'').trim();
    let without_exchange = match trimmed.rsplit_once(':') {
        Some((_, ticker)) => ticker,
        None => trimmed,
    };

    let symbol: String = without_exchange
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_' | '!'))
        .collect::<String>()
        .to_ascii_uppercase();

    if symbol.is_empty() { None } else { Some(symbol) }
}

/// Split a free-form symbol list ("vcb fpt, hpg") into normalised tickers,
/// keeping the first occurrence of each.
pub fn parse_symbols(text: &str) -> Vec<String> {
    let mut symbols: Vec<String> = Vec::new();
    for token in text.split(|c: char| c.is_whitespace() || c == ',' || c == ';') {
        if let Some(symbol) = normalize_symbol(token) {
            if !symbols.contains(&symbol) {
                symbols.push(symbol);
            }
        }
    }
    symbols
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_symbol() {
        assert_eq!(normalize_symbol(" vcb "), Some("VCB".to_string()));
        assert_eq!(normalize_symbol("HOSE:fpt"), Some("FPT".to_string()));
        assert_eq!(normalize_symbol("\"xauusd\""), Some("XAUUSD".to_string()));
        assert_eq!(normalize_symbol("   "), None);
    }

    #[test]
    fn test_parse_symbols_dedupes_in_order() {
        assert_eq!(parse_symbols("vcb fpt,VCB  hpg"), vec!["VCB", "FPT", "HPG"]);
        assert!(parse_symbols("").is_empty());
    }
}
