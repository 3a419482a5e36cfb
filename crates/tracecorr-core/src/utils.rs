//! String helpers shared by synthesis and rendering

/// Turn an arbitrary parameter name into a plan variable name.
///
/// Runs of characters outside `[A-Za-z0-9_]` collapse into one underscore,
/// leading/trailing underscores are trimmed, and names that would be empty
/// or start with a digit get a `var_` prefix.
pub fn to_variable_name(s: &str) -> String {
    let mut result = String::with_capacity(s.len());
    let mut prev_underscore = false;
    for ch in s.chars() {
        if ch.is_ascii_alphanumeric() {
            result.push(ch);
            prev_underscore = false;
        } else if !prev_underscore {
            result.push('_');
            prev_underscore = true;
        }
    }
    let trimmed = result.trim_matches('_');
    match trimmed.chars().next() {
        None => "var".to_string(),
        Some(first) if first.is_ascii_digit() => format!("var_{}", trimmed),
        Some(_) => trimmed.to_string(),
    }
}

/// Cut a string to at most `max` characters.
pub fn truncate_chars(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

/// Whether a character may appear in an XML 1.0 document.
pub fn is_xml_char(c: char) -> bool {
    crate::loader::is_valid_xml_char(c as u32)
}

/// Escape text for use in XML content or attribute values, dropping
/// characters XML cannot represent.
pub fn escape_xml(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars().filter(|c| is_xml_char(*c)) {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&apos;"),
            other => out.push(other),
        }
    }
    out
}

/// Wrap text in a CDATA section, splitting any embedded `]]>`.
pub fn cdata(s: &str) -> String {
    let clean: String = s.chars().filter(|c| is_xml_char(*c)).collect();
    format!("<![CDATA[{}]]>", clean.replace("]]>", "]]]]><![CDATA[>"))
}
