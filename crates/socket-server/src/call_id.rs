// Call-ID lookup on raw datagrams (RFC 3261 Section 20.8)
// Call-ID = ( "Call-ID" / "i" ) HCOLON callid
//
// Only the header name and its first token matter here. The scan works on
// the undecoded bytes, stops at the first NUL like a C string would, and
// treats a header as present only when it starts a line.

const LONG_FORM: &[u8] = b"call-id:";
const COMPACT_FORM: &[u8] = b"i:";

/// Extract the Call-ID value from a SIP datagram.
///
/// The long form `Call-ID:` wins over the compact form `i:` wherever each
/// appears. Leading blanks after the colon are skipped and the value ends at
/// the first whitespace. Returns `None` when no header starts a line or
/// the value is empty.
pub fn extract_call_id(datagram: &[u8]) -> Option<&[u8]> {
    let text = match datagram.iter().position(|&b| b == 0) {
        Some(nul) => &datagram[..nul],
        None => datagram,
    };

    let value_start = find_header(text, LONG_FORM).or_else(|| find_header(text, COMPACT_FORM))?;
    header_value(&text[value_start..])
}

/// Offset just past the first line-initial, case-insensitive `name`
fn find_header(text: &[u8], name: &[u8]) -> Option<usize> {
    if text.len() < name.len() {
        return None;
    }
    (0..=text.len() - name.len())
        .filter(|&i| i == 0 || text[i - 1] == b'\n' || text[i - 1] == b'\r')
        .find(|&i| text[i..i + name.len()].eq_ignore_ascii_case(name))
        .map(|i| i + name.len())
}

fn header_value(rest: &[u8]) -> Option<&[u8]> {
    let start = rest
        .iter()
        .position(|&b| b == b'\r' || b == b'\n' || !b.is_ascii_whitespace())?;
    let value = &rest[start..];
    let len = value
        .iter()
        .position(|b| b.is_ascii_whitespace())
        .unwrap_or(value.len());
    if len == 0 {
        return None;
    }
    Some(&value[..len])
}
