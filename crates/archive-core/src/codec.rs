//! Record encoding used between the block source, the followers and the index.

use bincode::{
    deserialize as de,
    serialize as ser,
};
use serde::{
    Serialize,
    de::DeserializeOwned,
};

type BoxError = Box<dyn std::error::Error + Send + Sync>;

#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("Failed to encode value")]
    Encode(#[source] BoxError),
    #[error("Failed to decode value")]
    Decode(#[source] BoxError),
}

/// Turns records into bytes and back.
///
/// The byte layout is private to the implementation; callers only rely on
/// `unmarshal(marshal(v)) == v`.
pub trait Codec: Clone + Send + Sync + 'static {
    fn marshal<T: Serialize + ?Sized>(&self, value: &T) -> Result<Vec<u8>, CodecError>;

    fn unmarshal<T: DeserializeOwned>(&self, data: &[u8]) -> Result<T, CodecError>;
}

/// Default codec backed by `bincode`.
#[derive(Debug, Default, Clone, Copy)]
pub struct BincodeCodec;

impl Codec for BincodeCodec {
    fn marshal<T: Serialize + ?Sized>(&self, value: &T) -> Result<Vec<u8>, CodecError> {
        ser(value).map_err(|err| CodecError::Encode(err.into()))
    }

    fn unmarshal<T: DeserializeOwned>(&self, data: &[u8]) -> Result<T, CodecError> {
        de(data).map_err(|err| CodecError::Decode(err.into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        BlockData,
        test_utils::generic_block_data,
    };

    #[test]
    fn test_block_data_survives_encoding() {
        let codec = BincodeCodec;
        let data = generic_block_data(3);

        let encoded = codec.marshal(&data).unwrap();
        let decoded: BlockData = codec.unmarshal(&encoded).unwrap();

        assert_eq!(decoded, data);
    }

    #[test]
    fn test_truncated_input_fails_to_decode() {
        let codec = BincodeCodec;
        let encoded = codec.marshal(&generic_block_data(3)).unwrap();

        let result: Result<BlockData, _> = codec.unmarshal(&encoded[..encoded.len() / 2]);

        assert!(matches!(result, Err(CodecError::Decode(_))));
    }
}
