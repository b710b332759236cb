pub mod error;

use bytes::Bytes;

/// Ordered header list. Names keep the casing they were written or received with.
pub type Headers = Vec<(Bytes, Bytes)>;

/// Returns the first value of header `name`, compared case-insensitively.
pub fn header_value<'a>(headers: &'a [(Bytes, Bytes)], name: &[u8]) -> Option<&'a Bytes> {
    headers
        .iter()
        .find(|(n, _)| n.eq_ignore_ascii_case(name))
        .map(|(_, v)| v)
}

/// Returns true if any comma separated token of header `name` equals `token`.
pub fn header_contains_token(headers: &[(Bytes, Bytes)], name: &[u8], token: &[u8]) -> bool {
    headers
        .iter()
        .filter(|(n, _)| n.eq_ignore_ascii_case(name))
        .flat_map(|(_, v)| v.split(|b| *b == b','))
        .any(|t| t.trim_ascii().eq_ignore_ascii_case(token))
}

pub(crate) fn is_token(s: &[u8]) -> bool {
    !s.is_empty()
        && s.iter().all(|b| {
            b.is_ascii_alphanumeric()
                || matches!(
                    b,
                    b'!' | b'#'
                        | b'$'
                        | b'%'
                        | b'&'
                        | b'\''
                        | b'*'
                        | b'+'
                        | b'-'
                        | b'.'
                        | b'^'
                        | b'_'
                        | b'`'
                        | b'|'
                        | b'~'
                )
        })
}

pub(crate) fn is_field_value(s: &[u8]) -> bool {
    s.iter().all(|b| *b == b'\t' || (*b >= 0x20 && *b != 0x7f))
}
