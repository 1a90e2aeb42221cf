//! Free-text memo conventions.
//!
//! Produced for client-facing transfer requests: `"Payment for Invoice <number>"`.
//! Accepted when scanning incoming transfers: `"Invoice <number>"`, a bare
//! `<number>`, and `"invoice: <number>"`, matched case-insensitively with an
//! ordered pattern list where the first matching pattern wins.

/// Memo placed on a payment request shown to the client.
pub fn payment_request_memo(number: &str) -> String {
    format!("Payment for Invoice {number}")
}

/// Memo carried by the notification ping self-transfer: references the
/// invoice and links the client to the payment page.
pub fn notification_memo(number: &str, url: &str) -> String {
    format!("Invoice {number} {url}")
}

/// Extract an invoice-number token from a transfer memo.
///
/// Pattern order: `Invoice <code>`, bare `<code>`, `invoice: <code>`. The
/// first pattern with a match wins, and within a pattern the earliest
/// occurrence wins. When a memo carries several invoice-shaped tokens the
/// tie-break beyond first-match-wins is unresolved product intent; no
/// stricter rule is applied here.
pub fn extract_invoice_number(memo: &str) -> Option<String> {
    let words: Vec<&str> = memo.split_whitespace().collect();

    // "Invoice <code>"
    for (i, word) in words.iter().enumerate() {
        if word.eq_ignore_ascii_case("invoice") {
            if let Some(code) = words.get(i + 1).and_then(|w| code_token(w)) {
                return Some(code);
            }
        }
    }

    // bare "<code>": the whole memo is a single code token
    if let [only] = words.as_slice() {
        if let Some(code) = code_token(only) {
            if code.len() == only.len() {
                return Some(code);
            }
        }
    }

    // "invoice: <code>" / "invoice:<code>"
    for (i, word) in words.iter().enumerate() {
        if word.eq_ignore_ascii_case("invoice:") {
            if let Some(code) = words.get(i + 1).and_then(|w| code_token(w)) {
                return Some(code);
            }
        }
        // byte index 8 is a char boundary whenever the prefix matches
        if word.len() > 8
            && word.get(..8).is_some_and(|p| p.eq_ignore_ascii_case("invoice:"))
        {
            if let Some(code) = code_token(&word[8..]) {
                return Some(code);
            }
        }
    }

    None
}

/// True when the memo carries a link, which marks self-transfers as
/// notification pings rather than payments.
pub fn contains_url(memo: &str) -> bool {
    let lower = memo.to_lowercase();
    lower.contains("http://") || lower.contains("https://")
}

/// Leading run of code characters from a word, accepted as an invoice number
/// only if it carries at least one digit (rules out plain prose). Tokens are
/// normalized to upper case; invoice numbers are issued upper-case, so this
/// keeps the whole convention case-insensitive through to the cache lookup.
fn code_token(word: &str) -> Option<String> {
    let code: String = word
        .chars()
        .take_while(|c| c.is_ascii_alphanumeric() || *c == '-' || *c == '_')
        .collect();
    if !code.is_empty() && code.chars().any(|c| c.is_ascii_digit()) {
        Some(code.to_ascii_uppercase())
    } else {
        None
    }
}
