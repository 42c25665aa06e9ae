//! First-bytes protocol classification for intercepted flows: TLS ClientHello
//! (SNI extraction), plaintext HTTP (Host header), or unknown.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    Unknown,
    Tls,
    Http,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClassifyResult {
    pub protocol: Protocol,
    pub host: Option<String>,
}

const TLS_HANDSHAKE: u8 = 0x16;
const HTTP_METHODS: [&str; 8] = [
    "GET", "POST", "PUT", "DELETE", "HEAD", "OPTIONS", "PATCH", "CONNECT",
];

/// Classifies a peeked prefix of a connection. Pure and deterministic: the
/// same bytes always produce the same result. A truncated TLS or HTTP
/// prefix still classifies by protocol, just without a host.
pub fn classify(bytes: &[u8]) -> ClassifyResult {
    if bytes.first() == Some(&TLS_HANDSHAKE) {
        return ClassifyResult {
            protocol: Protocol::Tls,
            host: parse_sni(bytes),
        };
    }
    if let Some(rest) = strip_http_method(bytes) {
        return ClassifyResult {
            protocol: Protocol::Http,
            host: parse_host_header(rest),
        };
    }
    ClassifyResult {
        protocol: Protocol::Unknown,
        host: None,
    }
}

fn strip_http_method(bytes: &[u8]) -> Option<&[u8]> {
    for method in HTTP_METHODS {
        let m = method.as_bytes();
        if bytes.len() > m.len() && bytes.starts_with(m) && bytes[m.len()] == b' ' {
            return Some(&bytes[m.len() + 1..]);
        }
    }
    None
}

/// Scans header lines for `Host:` case-insensitively and returns the value
/// with any trailing `:port` stripped. None when the header is not inside
/// the peeked window.
fn parse_host_header(bytes: &[u8]) -> Option<String> {
    let text = String::from_utf8_lossy(bytes);
    for line in text.split("\r\n").skip(1) {
        if line.is_empty() {
            // End of headers.
            return None;
        }
        let Some((name, value)) = line.split_once(':') else {
            continue;
        };
        if !name.trim().eq_ignore_ascii_case("host") {
            continue;
        }
        let mut host = value.trim().to_string();
        if let Some(idx) = host.rfind(':') {
            if host[idx + 1..].chars().all(|c| c.is_ascii_digit()) && idx + 1 < host.len() {
                host.truncate(idx);
            }
        }
        if host.is_empty() {
            return None;
        }
        return Some(host);
    }
    None
}

/// Walks the ClientHello and pulls the first `host_name` entry of the
/// server_name extension. Any parse shortfall yields None.
fn parse_sni(bytes: &[u8]) -> Option<String> {
    let mut cur = Cursor::new(bytes);
    // TLS record header: type, version, length.
    cur.skip(5)?;
    // Handshake header: ClientHello(1) + 24-bit length.
    if cur.u8()? != 0x01 {
        return None;
    }
    cur.skip(3)?;
    // Client version + random.
    cur.skip(2 + 32)?;
    let session_id_len = cur.u8()? as usize;
    cur.skip(session_id_len)?;
    let cipher_suites_len = cur.u16()? as usize;
    cur.skip(cipher_suites_len)?;
    let compression_len = cur.u8()? as usize;
    cur.skip(compression_len)?;

    let extensions_len = cur.u16()? as usize;
    let mut ext = cur.take(extensions_len)?;
    while ext.remaining() >= 4 {
        let ext_type = ext.u16()?;
        let ext_len = ext.u16()? as usize;
        let mut body = ext.take(ext_len)?;
        if ext_type != 0x0000 {
            continue;
        }
        // server_name_list: length, then (type, length, bytes) entries.
        let list_len = body.u16()? as usize;
        let mut list = body.take(list_len)?;
        while list.remaining() >= 3 {
            let name_type = list.u8()?;
            let name_len = list.u16()? as usize;
            let name = list.bytes(name_len)?;
            if name_type == 0x00 {
                return String::from_utf8(name.to_vec()).ok();
            }
        }
        return None;
    }
    None
}

struct Cursor<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    fn u8(&mut self) -> Option<u8> {
        let b = *self.data.get(self.pos)?;
        self.pos += 1;
        Some(b)
    }

    fn u16(&mut self) -> Option<u16> {
        let hi = self.u8()? as u16;
        let lo = self.u8()? as u16;
        Some((hi << 8) | lo)
    }

    fn skip(&mut self, n: usize) -> Option<()> {
        if self.remaining() < n {
            return None;
        }
        self.pos += n;
        Some(())
    }

    fn bytes(&mut self, n: usize) -> Option<&'a [u8]> {
        if self.remaining() < n {
            return None;
        }
        let out = &self.data[self.pos..self.pos + n];
        self.pos += n;
        Some(out)
    }

    fn take(&mut self, n: usize) -> Option<Cursor<'a>> {
        self.bytes(n).map(Cursor::new)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Minimal but well-formed ClientHello carrying one SNI entry.
    pub(crate) fn client_hello_with_sni(host: &str) -> Vec<u8> {
        let name = host.as_bytes();
        let mut sni_entry = vec![0x00]; // name_type host_name
        sni_entry.extend_from_slice(&(name.len() as u16).to_be_bytes());
        sni_entry.extend_from_slice(name);

        let mut sni_list = (sni_entry.len() as u16).to_be_bytes().to_vec();
        sni_list.extend_from_slice(&sni_entry);

        let mut extension = vec![0x00, 0x00]; // extension type server_name
        extension.extend_from_slice(&(sni_list.len() as u16).to_be_bytes());
        extension.extend_from_slice(&sni_list);

        let mut extensions = (extension.len() as u16).to_be_bytes().to_vec();
        extensions.extend_from_slice(&extension);

        let mut hello = vec![0x03, 0x03]; // client version TLS 1.2
        hello.extend_from_slice(&[0xAA; 32]); // random
        hello.push(0x00); // session id length
        hello.extend_from_slice(&[0x00, 0x02, 0x13, 0x01]); // one cipher suite
        hello.extend_from_slice(&[0x01, 0x00]); // null compression
        hello.extend_from_slice(&extensions);

        let mut handshake = vec![0x01]; // ClientHello
        let len = (hello.len() as u32).to_be_bytes();
        handshake.extend_from_slice(&len[1..]);
        handshake.extend_from_slice(&hello);

        let mut record = vec![0x16, 0x03, 0x01]; // handshake record, TLS 1.0
        record.extend_from_slice(&(handshake.len() as u16).to_be_bytes());
        record.extend_from_slice(&handshake);
        record
    }

    #[test]
    fn tls_client_hello_yields_sni() {
        let bytes = client_hello_with_sni("github.com");
        let result = classify(&bytes);
        assert_eq!(result.protocol, Protocol::Tls);
        assert_eq!(result.host.as_deref(), Some("github.com"));
    }

    #[test]
    fn truncated_client_hello_is_tls_without_host() {
        let bytes = client_hello_with_sni("github.com");
        let result = classify(&bytes[..20]);
        assert_eq!(result.protocol, Protocol::Tls);
        assert_eq!(result.host, None);
    }

    #[test]
    fn client_hello_without_extensions_is_tls_without_host() {
        let mut bytes = client_hello_with_sni("x");
        // Chop off the extensions block; lengths no longer line up, which is
        // exactly the shortfall case.
        bytes.truncate(50);
        let result = classify(&bytes);
        assert_eq!(result.protocol, Protocol::Tls);
        assert_eq!(result.host, None);
    }

    #[test]
    fn http_request_yields_host() {
        let req = b"GET / HTTP/1.1\r\nHost: example.com\r\nAccept: */*\r\n\r\n";
        let result = classify(req);
        assert_eq!(result.protocol, Protocol::Http);
        assert_eq!(result.host.as_deref(), Some("example.com"));
    }

    #[test]
    fn http_host_header_is_case_insensitive_and_port_stripped() {
        let req = b"POST /submit HTTP/1.1\r\nhOsT: evil.com:8080\r\n\r\n";
        let result = classify(req);
        assert_eq!(result.protocol, Protocol::Http);
        assert_eq!(result.host.as_deref(), Some("evil.com"));
    }

    #[test]
    fn http_without_host_in_window_yields_none() {
        let req = b"PUT /x HTTP/1.1\r\nAccept: */*\r\n";
        let result = classify(req);
        assert_eq!(result.protocol, Protocol::Http);
        assert_eq!(result.host, None);
    }

    #[test]
    fn all_methods_classify_as_http() {
        for method in HTTP_METHODS {
            let req = format!("{method} / HTTP/1.1\r\nHost: h\r\n\r\n");
            assert_eq!(classify(req.as_bytes()).protocol, Protocol::Http);
        }
    }

    #[test]
    fn method_requires_the_trailing_space() {
        assert_eq!(classify(b"GETTING").protocol, Protocol::Unknown);
        assert_eq!(classify(b"GET").protocol, Protocol::Unknown);
    }

    #[test]
    fn arbitrary_bytes_are_unknown() {
        let result = classify(&[0x00, 0x01, 0x02, 0x03]);
        assert_eq!(result.protocol, Protocol::Unknown);
        assert_eq!(result.host, None);
        assert_eq!(classify(b"").protocol, Protocol::Unknown);
    }

    #[test]
    fn classification_is_idempotent() {
        let bytes = client_hello_with_sni("registry.npmjs.org");
        let copy = bytes.clone();
        assert_eq!(classify(&bytes), classify(&copy));
    }
}
