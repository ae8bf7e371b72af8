#[inline]
pub(crate) fn is_ident_start(b: u8) -> bool {
    b.is_ascii_alphabetic() || b == b'_' || b >= 0x80
}

#[inline]
pub(crate) fn is_ident_char(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b == b'_' || b == b'$' || b >= 0x80
}

/// Split one SQL identifier off the front of `sql`, skipping leading
/// whitespace. Handles bare words and the four SQLite quoting styles
/// (`"x"`, `` `x` ``, `[x]`, `'x'`); doubled quote characters unescape.
pub(crate) fn take_identifier(sql: &str) -> Option<(String, &str)> {
    let sql = sql.trim_start();
    let bytes = sql.as_bytes();
    let first = *bytes.first()?;

    let close = match first {
        b'"' => b'"',
        b'`' => b'`',
        b'\'' => b'\'',
        b'[' => b']',
        _ if is_ident_start(first) => {
            let end = bytes.iter().position(|&b| !is_ident_char(b)).unwrap_or(bytes.len());
            return Some((sql[..end].to_string(), &sql[end..]));
        }
        _ => return None,
    };

    let mut name = String::new();
    let mut idx = 1;
    while idx < bytes.len() {
        if bytes[idx] == close {
            if close != b']' && bytes.get(idx + 1) == Some(&close) {
                name.push(close as char);
                idx += 2;
                continue;
            }
            return Some((name, &sql[idx + 1..]));
        }
        let ch = sql[idx..].chars().next()?;
        name.push(ch);
        idx += ch.len_utf8();
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn takes_bare_and_quoted_identifiers() {
        assert_eq!(take_identifier("  name TEXT"), Some(("name".to_string(), " TEXT")));
        assert_eq!(
            take_identifier("\"a \"\"b\"\" c\" INT"),
            Some(("a \"b\" c".to_string(), " INT"))
        );
        assert_eq!(take_identifier("[odd name]"), Some(("odd name".to_string(), "")));
        assert_eq!(take_identifier("`x`,"), Some(("x".to_string(), ",")));
        assert_eq!(take_identifier("(x)"), None);
        assert_eq!(take_identifier("\"unterminated"), None);
    }
}
