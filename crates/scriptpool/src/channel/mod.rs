//! Side channel between the supervisor and a worker process.
//!
//! A worker talks to its supervisor over two anonymous pipes that are
//! separate from its standard streams. The child sees them as descriptors
//! 3 (read) and 4 (write).
//!
//! # Wire format
//!
//! ```text
//! worker -> supervisor   b"ready"                      (once, unframed)
//! supervisor -> worker   [u32 BE len][function name]   (per call)
//!                        [u32 BE len][JSON argument]
//! worker -> supervisor   [u32 BE len][JSON result]
//! either direction       [0xFFFFFFFF]                  (optional end signal)
//! ```

pub mod frame;
pub mod pipe;
pub mod protocol;

pub use frame::{read_frame, write_end_signal, write_frame, Frame};
pub use pipe::DuplexChannel;
pub use protocol::{
    error_response, read_handshake, remote_error, write_handshake, REMOTE_ERROR_KEY,
};
