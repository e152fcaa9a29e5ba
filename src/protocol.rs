//! Shared protocol constants for the camrelay socket transport

// Every message starts with a fixed-width ASCII length header
pub const HEADER: usize = 100;

// Message payloads are short "origin:path" strings; anything this large is garbage
pub const MAX_FRAME_SIZE: usize = 64 * 1024;

// End-of-batch marker sent instead of a transfer request
pub const DISCONNECT: &str = "!DISCONNECT";

// Status replies are exactly STATUS_LEN bytes
pub const STATUS_LEN: usize = 4;

pub mod status {
    pub const OK: &[u8; 4] = b"  OK";
    pub const FAIL: &[u8; 4] = b"FAIL";
}

/// Default collector port for the socket lane
pub const DEFAULT_PORT: u16 = 7024;

/// Route accepted by the HTTP lane
pub const UPLOAD_ROUTE: &str = "/upload";

/// Multipart field names used by the HTTP lane
pub mod fields {
    pub const FILE: &str = "file";
    pub const CAMERA: &str = "camera";
    pub const CHECKSUM: &str = "checksum";
}
