//! Распознавание сигналов неудачи по первому ответу сервера

use std::fmt;

use desync_core::proto;

use crate::profile::DetectSet;

/// Сигнал неудачи попытки desync
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailureSignal {
    /// Соединение сброшено
    Reset,
    /// Редирект на чужой домен
    Redirect,
    /// TLS alert или подменённый Server Hello
    TlsError,
    /// Нет ответа за отведённое время
    Timeout,
}

impl FailureSignal {
    /// Метка детектора, к которой относится сигнал
    pub fn detect_bit(self) -> DetectSet {
        match self {
            FailureSignal::Reset | FailureSignal::Timeout => DetectSet::TORST,
            FailureSignal::Redirect => DetectSet::REDIRECT,
            FailureSignal::TlsError => DetectSet::SSL_ERR,
        }
    }
}

impl fmt::Display for FailureSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            FailureSignal::Reset => "reset",
            FailureSignal::Redirect => "redirect",
            FailureSignal::TlsError => "ssl_err",
            FailureSignal::Timeout => "timeout",
        })
    }
}

/// Классифицировать первый ответ на запрос
pub fn classify_response(request: &[u8], response: &[u8]) -> Option<FailureSignal> {
    if proto::is_tls_client_hello(request) {
        if proto::is_tls_alert(response) || proto::tls_session_id_mismatch(request, response) {
            return Some(FailureSignal::TlsError);
        }
        return None;
    }
    if is_http_redirect(request, response) {
        return Some(FailureSignal::Redirect);
    }
    None
}

/// Является ли ответ редиректом (300..=308) на домен, отличный от запрошенного
///
/// Домены сравниваются по двум последним меткам имени из заголовка Host.
pub fn is_http_redirect(request: &[u8], response: &[u8]) -> bool {
    let Some(host) = proto::parse_http_host(request) else {
        return false;
    };
    let Some(req_host) = request
        .get(host.field.pos..host.field.pos + host.field.len)
        .and_then(|b| std::str::from_utf8(b).ok())
    else {
        return false;
    };

    let mut headers = [httparse::EMPTY_HEADER; 32];
    let mut resp = httparse::Response::new(&mut headers);
    match resp.parse(response) {
        Ok(httparse::Status::Complete(_)) => {}
        _ => return false,
    }
    if !matches!(resp.code, Some(300..=308)) {
        return false;
    }

    let Some(location) = resp
        .headers
        .iter()
        .find(|h| h.name.eq_ignore_ascii_case("location"))
        .and_then(|h| std::str::from_utf8(h.value).ok())
    else {
        return false;
    };

    // Относительный Location ведёт на тот же хост
    let Some((_, rest)) = location.trim().split_once("://") else {
        return false;
    };
    let loc_host = rest
        .split(['/', '?', '#'])
        .next()
        .unwrap_or_default()
        .rsplit('@')
        .next()
        .unwrap_or_default();
    let loc_host = strip_port(loc_host);

    let site = registrable_suffix(req_host);
    let loc_host = loc_host.to_ascii_lowercase();
    !(loc_host == site || loc_host.ends_with(&format!(".{}", site)))
}

fn strip_port(host: &str) -> &str {
    if let Some(inner) = host.strip_prefix('[') {
        return inner.split(']').next().unwrap_or_default();
    }
    match host.rsplit_once(':') {
        Some((name, port)) if port.bytes().all(|c| c.is_ascii_digit()) => name,
        _ => host,
    }
}

/// Две последние метки имени (`www.example.com` -> `example.com`)
fn registrable_suffix(host: &str) -> String {
    let host = host.trim_end_matches('.').to_ascii_lowercase();
    let labels: Vec<&str> = host.rsplitn(3, '.').collect();
    match labels.as_slice() {
        [tld, sld, ..] => format!("{}.{}", sld, tld),
        _ => host,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const REQ: &[u8] = b"GET / HTTP/1.1\r\nHost: www.example.com\r\n\r\n";

    fn redirect(location: &str) -> Vec<u8> {
        format!("HTTP/1.1 302 Found\r\nLocation: {}\r\nContent-Length: 0\r\n\r\n", location)
            .into_bytes()
    }

    #[test]
    fn test_redirect_foreign() {
        assert!(is_http_redirect(REQ, &redirect("http://warning.rt.ru/?id=1")));
        assert_eq!(
            classify_response(REQ, &redirect("https://blocked.isp.net/")),
            Some(FailureSignal::Redirect)
        );
    }

    #[test]
    fn test_redirect_same_site() {
        assert!(!is_http_redirect(REQ, &redirect("https://example.com/")));
        assert!(!is_http_redirect(REQ, &redirect("https://m.example.com:443/x")));
        assert!(!is_http_redirect(REQ, &redirect("/relative/path")));
    }

    #[test]
    fn test_not_redirect() {
        let ok = b"HTTP/1.1 200 OK\r\nContent-Length: 0\r\n\r\n";
        assert!(!is_http_redirect(REQ, ok));
        assert!(!is_http_redirect(REQ, b"HTTP/1.1 30"));
        assert_eq!(classify_response(REQ, ok), None);
    }

    #[test]
    fn test_tls_signals() {
        let mut hello = vec![0x16, 0x03, 0x01, 0x00, 0x40, 0x01];
        hello.resize(44, 0);
        hello[43] = 4;
        hello.extend_from_slice(&[1, 2, 3, 4]);

        let alert = [0x15, 0x03, 0x03, 0x00, 0x02, 0x02, 0x28];
        assert_eq!(classify_response(&hello, &alert), Some(FailureSignal::TlsError));

        let mut server = hello.clone();
        server[5] = 0x02;
        assert_eq!(classify_response(&hello, &server), None);
        server[44] = 9;
        assert_eq!(classify_response(&hello, &server), Some(FailureSignal::TlsError));
    }

    #[test]
    fn test_signal_bits() {
        assert_eq!(FailureSignal::Timeout.detect_bit(), DetectSet::TORST);
        assert_eq!(FailureSignal::Reset.detect_bit(), DetectSet::TORST);
        assert_eq!(FailureSignal::TlsError.to_string(), "ssl_err");
    }

    #[test]
    fn test_registrable_suffix() {
        assert_eq!(registrable_suffix("a.b.example.com"), "example.com");
        assert_eq!(registrable_suffix("localhost"), "localhost");
    }
}
