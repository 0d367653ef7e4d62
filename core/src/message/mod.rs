// Message module: wire envelope, alert payloads and JSON framing

pub mod alert;
pub mod codec;
pub mod types;

pub use alert::{Alert, CachedAlert};
pub use codec::{decode_envelope, encode_envelope, CodecError, MAX_MESSAGE_SIZE};
pub use types::{Envelope, Payload, KNOWN_MESSAGE_TYPES};
