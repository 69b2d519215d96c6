//! Oracle wire messages and their framing.
//!
//! Every message is a JSON document preceded by its length as a 4-byte big-endian integer.
//! One request is answered by exactly one response; the helper speaks first with
//! [`Response::Ready`] once it has started.

use std::{
    io::{Read, Write},
    path::PathBuf,
};

use serde::{de::DeserializeOwned, Deserialize, Serialize};

use crate::{recovery::oracle::RuntimeVersion, Error, Result};

/// Default upper bound for a single frame.
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 256 * 1024 * 1024;

/// The file the helper should load.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TargetSource {
    /// Load from disk
    Path(PathBuf),
    /// Load from the given image bytes
    Bytes(Vec<u8>),
}

/// Requests sent to the helper, in the only order it accepts them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "method", content = "params", rename_all = "snake_case")]
pub enum Request {
    /// Hook JIT compilation and run the given module initializer code in place of the
    /// target's own to bootstrap its decryption state
    InstallDecryptHook {
        /// Body bytes of the replacement module initializer
        module_cctor_bytes: Vec<u8>,
    },
    /// Load the target file and run its module initializer
    LoadTarget(TargetSource),
    /// Return every method body the hook has observed
    DecryptMethods,
    /// Exit the helper
    Shutdown,
}

/// A method body captured by the helper.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireMethod {
    /// Raw method token
    pub token: u32,
    /// RVA of the method header in the target
    pub rva: u32,
    /// Complete method body record
    pub body: Vec<u8>,
}

/// Responses sent by the helper.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "result", content = "data", rename_all = "snake_case")]
pub enum Response {
    /// The helper is up and hosts the given runtime
    Ready {
        /// Runtime the helper process runs on
        runtime: RuntimeVersion,
    },
    /// The request was carried out
    Ack,
    /// Answer to [`Request::DecryptMethods`]
    DecryptedMethods(Vec<WireMethod>),
    /// The helper could not carry out the request
    Error {
        /// Helper-side description
        message: String,
    },
}

/// Serialize `message` and write it as one frame.
///
/// # Errors
/// Returns [`Error::OracleProtocol`] if the encoded message exceeds `max_size`,
/// [`Error::Serialization`] or [`Error::FileError`] otherwise.
pub fn write_frame<W, T>(writer: &mut W, message: &T, max_size: usize) -> Result<()>
where
    W: Write,
    T: Serialize,
{
    let json = serde_json::to_vec(message)?;
    if json.len() > max_size || u32::try_from(json.len()).is_err() {
        return Err(Error::OracleProtocol {
            stage: "write",
            message: format!("Message too large: {} bytes (max {})", json.len(), max_size),
        });
    }

    let len = json.len() as u32;
    writer.write_all(&len.to_be_bytes())?;
    writer.write_all(&json)?;
    writer.flush()?;

    Ok(())
}

/// Read one frame and deserialize it.
///
/// # Errors
/// Returns [`Error::OracleProtocol`] if the announced length exceeds `max_size`,
/// [`Error::FileError`] if the stream ends early and [`Error::Serialization`] for a body that
/// is not a valid message.
pub fn read_frame<R, T>(reader: &mut R, max_size: usize) -> Result<T>
where
    R: Read,
    T: DeserializeOwned,
{
    let mut len_bytes = [0u8; 4];
    reader.read_exact(&mut len_bytes)?;
    let len = u32::from_be_bytes(len_bytes) as usize;

    if len > max_size {
        return Err(Error::OracleProtocol {
            stage: "read",
            message: format!("Message too large: {len} bytes (max {max_size})"),
        });
    }

    let mut buffer = vec![0u8; len];
    reader.read_exact(&mut buffer)?;

    Ok(serde_json::from_slice(&buffer)?)
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use super::*;

    #[test]
    fn frames_round_trip() {
        let mut wire = Vec::new();
        let requests = [
            Request::InstallDecryptHook {
                module_cctor_bytes: vec![0x0A, 0x00, 0x2A],
            },
            Request::LoadTarget(TargetSource::Path(PathBuf::from("/tmp/target.exe"))),
            Request::DecryptMethods,
        ];
        for request in &requests {
            write_frame(&mut wire, request, DEFAULT_MAX_MESSAGE_SIZE).unwrap();
        }

        let mut cursor = Cursor::new(wire);
        for request in &requests {
            let read: Request = read_frame(&mut cursor, DEFAULT_MAX_MESSAGE_SIZE).unwrap();
            assert_eq!(&read, request);
        }
        assert!(read_frame::<_, Request>(&mut cursor, DEFAULT_MAX_MESSAGE_SIZE).is_err());
    }

    #[test]
    fn length_prefix_is_big_endian() {
        let mut wire = Vec::new();
        write_frame(&mut wire, &Response::Ack, 1024).unwrap();
        let json = serde_json::to_vec(&Response::Ack).unwrap();
        assert_eq!(&wire[..4], &(json.len() as u32).to_be_bytes());
        assert_eq!(&wire[4..], &json[..]);
    }

    #[test]
    fn wire_shape() {
        let ready = serde_json::to_value(Response::Ready {
            runtime: RuntimeVersion::Clr40,
        })
        .unwrap();
        assert_eq!(
            ready,
            serde_json::json!({"result": "ready", "data": {"runtime": "clr40"}})
        );

        let request = serde_json::to_value(Request::DecryptMethods).unwrap();
        assert_eq!(request, serde_json::json!({"method": "decrypt_methods"}));
    }

    #[test]
    fn oversized_frames_are_rejected() {
        let mut wire = Vec::new();
        assert!(matches!(
            write_frame(&mut wire, &Request::DecryptMethods, 4),
            Err(Error::OracleProtocol { .. })
        ));
        assert!(wire.is_empty());

        let mut cursor = Cursor::new(vec![0x7F, 0xFF, 0xFF, 0xFF]);
        assert!(matches!(
            read_frame::<_, Response>(&mut cursor, 1024),
            Err(Error::OracleProtocol { .. })
        ));

        let mut garbage = Vec::new();
        garbage.extend_from_slice(&3u32.to_be_bytes());
        garbage.extend_from_slice(b"{{{");
        assert!(matches!(
            read_frame::<_, Response>(&mut Cursor::new(garbage), 1024),
            Err(Error::Serialization(_))
        ));
    }
}
