// 伪造 SIP 请求，只求长得像，接收方不会处理
const USER_AGENT: &str = "Linphone/5.2.0 (belle-sip/5.2.0)";

fn random_token(len: usize) -> String {
    let mut out = String::with_capacity(len);
    while out.len() < len {
        out.push_str(&format!("{:016x}", rand::random::<u64>()));
    }
    out.truncate(len);
    out
}

/// Host part of a SIP URI: `sip:alice@example.com:5060;transport=udp` -> `example.com`.
fn uri_host(uri: &str) -> &str {
    let rest = uri
        .strip_prefix("sips:")
        .or_else(|| uri.strip_prefix("sip:"))
        .unwrap_or(uri);
    let rest = rest.rsplit_once('@').map_or(rest, |(_, host)| host);
    let end = rest.find([':', ';', '?', '>']).unwrap_or(rest.len());
    &rest[..end]
}

fn normalize_uri(target: &str) -> String {
    if target.starts_with("sip:") || target.starts_with("sips:") {
        target.to_string()
    } else {
        format!("sip:{target}")
    }
}

/// Renders a complete `OPTIONS` request towards `target` (URI or bare host).
pub fn render_options(target: &str) -> Vec<u8> {
    let uri = normalize_uri(target);
    let host = uri_host(&uri);
    let branch = random_token(16);
    let tag = random_token(10);
    let call_id = random_token(24);

    format!(
        "OPTIONS {uri} SIP/2.0\r\n\
         Via: SIP/2.0/UDP {host};rport;branch=z9hG4bK{branch}\r\n\
         Max-Forwards: 70\r\n\
         From: <{uri}>;tag={tag}\r\n\
         To: <{uri}>\r\n\
         Call-ID: {call_id}@{host}\r\n\
         CSeq: 1 OPTIONS\r\n\
         Accept: application/sdp\r\n\
         User-Agent: {USER_AGENT}\r\n\
         Content-Length: 0\r\n\
         \r\n"
    )
    .into_bytes()
}
