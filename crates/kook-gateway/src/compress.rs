//! zlib inflation for `compress=1` sessions.

use std::io::Read;

use flate2::read::ZlibDecoder;

use crate::error::GatewayError;

pub fn inflate(bytes: &[u8]) -> Result<String, GatewayError> {
    let mut text = String::new();
    ZlibDecoder::new(bytes)
        .read_to_string(&mut text)
        .map_err(GatewayError::Inflate)?;
    Ok(text)
}

#[cfg(test)]
pub(crate) fn deflate(text: &str) -> Vec<u8> {
    use flate2::{Compression, write::ZlibEncoder};
    use std::io::Write;

    let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(text.as_bytes()).unwrap();
    encoder.finish().unwrap()
}
