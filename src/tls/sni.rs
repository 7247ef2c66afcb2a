//! Minimal ClientHello parse that pulls out the SNI host name. Used by the
//! passthrough listener, which peeks the first record without consuming it
//! and routes on the name.

/// Extract the SNI server name from the start of a TLS stream, if the
/// buffer holds a ClientHello with a server_name extension.
pub fn extract_sni(buf: &[u8]) -> Option<String> {
    // TLS record header: type (0x16 = handshake), version, length.
    if buf.len() < 5 || buf[0] != 0x16 {
        return None;
    }
    let mut pos = 5;

    // Handshake header: type (0x01 = ClientHello) + 3-byte length.
    if pos + 4 > buf.len() || buf[pos] != 0x01 {
        return None;
    }
    pos += 4;

    // client_version (2) + random (32).
    pos += 34;
    if pos + 1 > buf.len() {
        return None;
    }

    // session_id
    let session_id_len = buf[pos] as usize;
    pos += 1 + session_id_len;
    if pos + 2 > buf.len() {
        return None;
    }

    // cipher_suites
    let cipher_suites_len = u16_at(buf, pos)? as usize;
    pos += 2 + cipher_suites_len;
    if pos + 1 > buf.len() {
        return None;
    }

    // compression_methods
    let compression_len = buf[pos] as usize;
    pos += 1 + compression_len;
    if pos + 2 > buf.len() {
        return None;
    }

    // extensions
    let extensions_len = u16_at(buf, pos)? as usize;
    pos += 2;
    let extensions_end = (pos + extensions_len).min(buf.len());

    while pos + 4 <= extensions_end {
        let ext_type = u16_at(buf, pos)?;
        let ext_len = u16_at(buf, pos + 2)? as usize;
        pos += 4;
        if pos + ext_len > extensions_end {
            return None;
        }
        if ext_type == 0 {
            // server_name: list length (2), entry type (1), name length (2).
            if ext_len < 5 {
                return None;
            }
            let name_type = buf[pos + 2];
            if name_type != 0 {
                return None;
            }
            let name_len = u16_at(buf, pos + 3)? as usize;
            if pos + 5 + name_len > extensions_end {
                return None;
            }
            let name = &buf[pos + 5..pos + 5 + name_len];
            return std::str::from_utf8(name).ok().map(|s| s.to_string());
        }
        pos += ext_len;
    }
    None
}

fn u16_at(buf: &[u8], pos: usize) -> Option<u16> {
    if pos + 2 > buf.len() {
        return None;
    }
    Some(((buf[pos] as u16) << 8) | buf[pos + 1] as u16)
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Build a syntactically valid ClientHello carrying the given SNI.
    fn client_hello(sni: Option<&str>) -> Vec<u8> {
        let mut extensions = Vec::new();
        if let Some(name) = sni {
            let name = name.as_bytes();
            let mut ext = Vec::new();
            ext.extend_from_slice(&[0x00, 0x00]); // server_name
            let list_len = 3 + name.len();
            let ext_len = 2 + list_len;
            ext.extend_from_slice(&(ext_len as u16).to_be_bytes());
            ext.extend_from_slice(&(list_len as u16).to_be_bytes());
            ext.push(0x00); // host_name
            ext.extend_from_slice(&(name.len() as u16).to_be_bytes());
            ext.extend_from_slice(name);
            extensions.extend_from_slice(&ext);
        }

        let mut body = Vec::new();
        body.extend_from_slice(&[0x03, 0x03]); // client_version
        body.extend_from_slice(&[0u8; 32]); // random
        body.push(0); // session_id length
        body.extend_from_slice(&[0x00, 0x02, 0x13, 0x01]); // one cipher suite
        body.extend_from_slice(&[0x01, 0x00]); // null compression
        body.extend_from_slice(&(extensions.len() as u16).to_be_bytes());
        body.extend_from_slice(&extensions);

        let mut handshake = vec![0x01];
        handshake.extend_from_slice(&(body.len() as u32).to_be_bytes()[1..]);
        handshake.extend_from_slice(&body);

        let mut record = vec![0x16, 0x03, 0x01];
        record.extend_from_slice(&(handshake.len() as u16).to_be_bytes());
        record.extend_from_slice(&handshake);
        record
    }

    #[test]
    fn test_extracts_sni() {
        let hello = client_hello(Some("api.example.com"));
        assert_eq!(extract_sni(&hello), Some("api.example.com".to_string()));
    }

    #[test]
    fn test_no_sni_extension() {
        let hello = client_hello(None);
        assert_eq!(extract_sni(&hello), None);
    }

    #[test]
    fn test_not_a_tls_record() {
        assert_eq!(extract_sni(b"GET / HTTP/1.1\r\n"), None);
        assert_eq!(extract_sni(&[]), None);
    }

    #[test]
    fn test_truncated_hello() {
        let hello = client_hello(Some("api.example.com"));
        for cut in [0, 4, 10, 40, hello.len() - 4] {
            // Truncation must never panic, only fail to find a name.
            let _ = extract_sni(&hello[..cut]);
        }
    }
}
