//! Serialization layer: wire shapes to and from JSON bytes
//!
//! Messages and snapshot chunks travel as JSON so that hosts written in other
//! languages can read them. Payloads are carried as `bytes::Bytes` to match
//! the blob storage and transport boundaries.

use crate::error::Result;
use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;

/// Serialize any wire message to bytes
pub fn encode_message<M: Serialize>(msg: &M) -> Result<Bytes> {
    let buf = serde_json::to_vec(msg)?;
    Ok(Bytes::from(buf))
}

/// Deserialize a wire message from bytes
pub fn decode_message<M: DeserializeOwned>(bytes: &[u8]) -> Result<M> {
    Ok(serde_json::from_slice(bytes)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crdt::merge_tree::PropertySet;
    use crate::error::Error;
    use crate::protocol::{MergeTreeOp, ObjectMessage, SequencedMessage};

    #[test]
    fn test_sequenced_message_bytes() {
        let props: PropertySet = [("color", "red")].into_iter().collect();
        let message = ObjectMessage {
            reference_sequence_number: 2,
            contents: MergeTreeOp::annotate(0, 5, props),
        };
        let sequenced = SequencedMessage::sequenced(message, "bob", 3, 1);

        let bytes = encode_message(&sequenced).unwrap();
        let decoded: SequencedMessage = decode_message(&bytes).unwrap();

        assert_eq!(decoded, sequenced);
    }

    #[test]
    fn test_decode_rejects_unknown_op_type() {
        let bytes = br#"{"referenceSequenceNumber":0,"contents":{"type":"SPLICE","pos1":0}}"#;
        let result: Result<ObjectMessage> = decode_message(bytes);

        assert!(matches!(result, Err(Error::Codec(_))));
    }
}
