//! Встроенные шаблоны и правка TLS Client Hello
//!
//! - [`TLS_TEMPLATE`]: Client Hello TLS 1.3 на 517 байт с SNI
//!   `www.wikipedia.org` и расширением padding;
//! - [`http_request`]: минимальный HTTP запрос;
//! - [`change_sni`]: замена имени в SNI с пересчётом всех вложенных длин;
//! - [`randomize`]: случайные `random`, `session_id` и ключи key_share.

use rand::RngCore;
use tracing::trace;

use desync_core::proto::{
    self, find_ext_block, find_tls_ext, read_u16, write_u16, EXT_KEY_SHARE, EXT_PADDING,
    EXT_SERVER_NAME,
};

use crate::error::FakeError;
use crate::sni::MAX_HOST_LEN;

/// Размер встроенного Client Hello
pub const TLS_TEMPLATE_LEN: usize = 517;

/// Имя хоста во встроенных шаблонах
pub const TEMPLATE_HOST: &str = "www.wikipedia.org";

/// Значимая часть шаблона до тела padding (тело padding заполнено нулями)
const TLS_PREFIX: &[u8] = b"\
    \x16\x03\x01\x02\x00\x01\x00\x01\xfc\x03\x03\x03\x5f\x6f\x2c\xed\
    \x13\x22\xf8\xdc\xb2\xf2\x60\x48\x2d\x72\x66\x6f\x57\xdd\x13\x9d\
    \x1b\x37\xdc\xfa\x36\x2e\xba\xf9\x92\x99\x3a\x20\xf9\xdf\x0c\x2e\
    \x8a\x55\x89\x82\x31\x63\x1a\xef\xa8\xbe\x08\x58\xa7\xa3\x5a\x18\
    \xd3\x96\x5f\x04\x5c\xb4\x62\xaf\x89\xd7\x0f\x8b\x00\x3e\x13\x02\
    \x13\x03\x13\x01\xc0\x2c\xc0\x30\x00\x9f\xcc\xa9\xcc\xa8\xcc\xaa\
    \xc0\x2b\xc0\x2f\x00\x9e\xc0\x24\xc0\x28\x00\x6b\xc0\x23\xc0\x27\
    \x00\x67\xc0\x0a\xc0\x14\x00\x39\xc0\x09\xc0\x13\x00\x33\x00\x9d\
    \x00\x9c\x00\x3d\x00\x3c\x00\x35\x00\x2f\x00\xff\x01\x00\x01\x75\
    \x00\x00\x00\x16\x00\x14\x00\x00\x11\x77\x77\x77\x2e\x77\x69\x6b\
    \x69\x70\x65\x64\x69\x61\x2e\x6f\x72\x67\x00\x0b\x00\x04\x03\x00\
    \x01\x02\x00\x0a\x00\x16\x00\x14\x00\x1d\x00\x17\x00\x1e\x00\x19\
    \x00\x18\x01\x00\x01\x01\x01\x02\x01\x03\x01\x04\x00\x10\x00\x0e\
    \x00\x0c\x02\x68\x32\x08\x68\x74\x74\x70\x2f\x31\x2e\x31\x00\x16\
    \x00\x00\x00\x17\x00\x00\x00\x31\x00\x00\x00\x0d\x00\x2a\x00\x28\
    \x04\x03\x05\x03\x06\x03\x08\x07\x08\x08\x08\x09\x08\x0a\x08\x0b\
    \x08\x04\x08\x05\x08\x06\x04\x01\x05\x01\x06\x01\x03\x03\x03\x01\
    \x03\x02\x04\x02\x05\x02\x06\x02\x00\x2b\x00\x09\x08\x03\x04\x03\
    \x03\x03\x02\x03\x01\x00\x2d\x00\x02\x01\x01\x00\x33\x00\x26\x00\
    \x24\x00\x1d\x00\x20\x11\x8c\xb8\x8c\xe8\x8a\x08\x90\x1e\xee\x19\
    \xd9\xdd\xe8\xd4\x06\xb1\xd1\xe2\xab\xe0\x16\x63\xd6\xdc\xda\x84\
    \xa4\xb8\x4b\xfb\x0e\x00\x15\x00\xac";

/// Встроенный Client Hello
pub static TLS_TEMPLATE: [u8; TLS_TEMPLATE_LEN] = zero_padded(TLS_PREFIX);

const fn zero_padded(prefix: &[u8]) -> [u8; TLS_TEMPLATE_LEN] {
    let mut out = [0u8; TLS_TEMPLATE_LEN];
    let mut i = 0;
    while i < prefix.len() {
        out[i] = prefix[i];
        i += 1;
    }
    out
}

/// Минимальный HTTP запрос к `host`
pub fn http_request(host: &str) -> Vec<u8> {
    format!("GET / HTTP/1.1\r\nHost: {}\r\n\r\n", host).into_bytes()
}

/// Заменить имя хоста в SNI
///
/// Обрабатывается только первая TLS запись. Длины записи, handshake, блока
/// расширений и расширения server_name пересчитываются. Если есть расширение
/// padding, оно поглощает разницу, и размер Client Hello не меняется.
pub fn change_sni(hello: &[u8], host: &str) -> Result<Vec<u8>, FakeError> {
    if !proto::is_tls_client_hello(hello) {
        return Err(FakeError::NotClientHello);
    }
    let host = host.as_bytes();
    if host.is_empty() || host.len() > MAX_HOST_LEN {
        return Err(FakeError::HostTooLong(host.len()));
    }

    let rec_len = read_u16(hello, 3).ok_or(FakeError::NotClientHello)? as usize;
    let hello = &hello[..(5 + rec_len).min(hello.len())];
    let ext_block = find_ext_block(hello).ok_or(FakeError::NotClientHello)?;
    let sni = find_tls_ext(hello, ext_block, EXT_SERVER_NAME).ok_or(FakeError::NotClientHello)?;
    let old_len = read_u16(hello, sni + 7).ok_or(FakeError::NotClientHello)? as usize;
    let name_at = sni + 9;
    if name_at + old_len > hello.len() {
        return Err(FakeError::NotClientHello);
    }

    let mut out = Vec::with_capacity(hello.len() + host.len());
    out.extend_from_slice(&hello[..name_at]);
    out.extend_from_slice(host);
    out.extend_from_slice(&hello[name_at + old_len..]);

    write_u16(&mut out, sni + 2, (host.len() + 5) as u16);
    write_u16(&mut out, sni + 4, (host.len() + 3) as u16);
    write_u16(&mut out, sni + 7, host.len() as u16);
    fix_lengths(&mut out, ext_block);

    let delta = host.len() as isize - old_len as isize;
    if delta != 0 && absorb_padding(&mut out, ext_block, delta) {
        fix_lengths(&mut out, ext_block);
    }
    trace!("sni: {} -> {} bytes", old_len, host.len());
    Ok(out)
}

/// Длины записи, handshake и блока расширений по фактическому размеру
fn fix_lengths(buf: &mut [u8], ext_block: usize) {
    let len = buf.len();
    write_u16(buf, 3, (len - 5) as u16);
    let hs = ((len - 9) as u32).to_be_bytes();
    buf[6..9].copy_from_slice(&hs[1..]);
    write_u16(buf, ext_block, (len - ext_block - 2) as u16);
}

/// Изменить тело padding на `-delta` байт; `false`, если padding нет или он мал
fn absorb_padding(buf: &mut Vec<u8>, ext_block: usize, delta: isize) -> bool {
    let Some(pad) = find_tls_ext(buf, ext_block, EXT_PADDING) else {
        return false;
    };
    let Some(pad_len) = read_u16(buf, pad + 2) else {
        return false;
    };
    let body = pad + 4;
    let new_len = pad_len as isize - delta;
    if new_len < 0 || body + pad_len as usize > buf.len() {
        return false;
    }

    if delta > 0 {
        buf.drain(body..body + delta as usize);
    } else {
        buf.splice(body..body, std::iter::repeat(0).take((-delta) as usize));
    }
    write_u16(buf, pad + 2, new_len as u16);
    true
}

/// Заполнить случайными байтами `random`, `session_id` и ключи key_share
pub fn randomize<R: RngCore + ?Sized>(hello: &mut [u8], rng: &mut R) {
    if hello.len() < 44 {
        return;
    }
    rng.fill_bytes(&mut hello[11..43]);
    let sid = hello[43] as usize;
    if 44 + sid <= hello.len() {
        rng.fill_bytes(&mut hello[44..44 + sid]);
    }

    let Some(ext_block) = find_ext_block(hello) else {
        return;
    };
    let Some(ks) = find_tls_ext(hello, ext_block, EXT_KEY_SHARE) else {
        return;
    };
    let Some(ks_len) = read_u16(hello, ks + 2) else {
        return;
    };
    let end = (ks + 4 + ks_len as usize).min(hello.len());

    // client_shares: u16 длина списка, затем (group, key_len, key)*
    let mut at = ks + 6;
    while at + 4 <= end {
        let Some(key_len) = read_u16(hello, at + 2) else {
            return;
        };
        let key_end = at + 4 + key_len as usize;
        if key_end > end {
            return;
        }
        rng.fill_bytes(&mut hello[at + 4..key_end]);
        at = key_end;
    }
}
