use base64::prelude::BASE64_STANDARD;
use base64::Engine;
use sha1::{Digest, Sha1};

pub(crate) const MAGIC_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

// Accept value: SHA-1 over the client key with the fixed GUID appended,
// base64-encoded
pub(crate) fn generate_websocket_accept_value(key: &str) -> String {
    let digest = Sha1::digest(format!("{}{}", key, MAGIC_GUID));
    BASE64_STANDARD.encode(digest)
}

// The handshake key is sixteen raw bytes from the thread CSPRNG
pub(crate) fn generate_websocket_key() -> String {
    BASE64_STANDARD.encode(rand::random::<[u8; 16]>())
}
