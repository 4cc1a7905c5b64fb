//! Room identifiers.
//!
//! A room is named after the node id of its creator: 64 hexadecimal
//! characters. Input is validated here, before any network call is made.

use iroh::NodeId;

use crate::error::RoomIdError;

/// Iroh node ids are 64-character hex strings.
pub const ROOM_ID_LENGTH: usize = 64;

/// Validate user input and turn it into the node id to dial.
pub fn parse_room_id(input: &str) -> Result<NodeId, RoomIdError> {
    let input = input.trim();
    if input.is_empty() {
        return Err(RoomIdError::Empty);
    }
    let length = input.chars().count();
    if length != ROOM_ID_LENGTH {
        return Err(RoomIdError::WrongLength {
            expected: ROOM_ID_LENGTH,
            actual: length,
        });
    }
    let mut bytes = [0u8; ROOM_ID_LENGTH / 2];
    hex::decode_to_slice(input, &mut bytes).map_err(|_| RoomIdError::NotHex)?;
    NodeId::from_bytes(&bytes).map_err(|_| RoomIdError::InvalidKey)
}

/// Render a node id as a shareable room id.
pub fn room_id(node_id: &NodeId) -> String {
    hex::encode(node_id.as_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;
    use iroh::SecretKey;

    #[test]
    fn round_trips_a_real_node_id() {
        let node_id = SecretKey::generate(rand::rngs::OsRng).public();
        let id = room_id(&node_id);
        assert_eq!(id.len(), ROOM_ID_LENGTH);
        assert_eq!(parse_room_id(&id).unwrap(), node_id);
        assert_eq!(parse_room_id(&id.to_uppercase()).unwrap(), node_id);
        assert_eq!(parse_room_id(&format!("  {id}\n")).unwrap(), node_id);
    }

    #[test]
    fn each_failure_has_its_own_message() {
        assert_eq!(parse_room_id(""), Err(RoomIdError::Empty));
        assert_eq!(parse_room_id("   "), Err(RoomIdError::Empty));
        assert_eq!(
            RoomIdError::Empty.to_string(),
            "Room ID is required"
        );

        let err = parse_room_id("abc").unwrap_err();
        assert_eq!(
            err,
            RoomIdError::WrongLength {
                expected: 64,
                actual: 3
            }
        );
        assert_eq!(
            err.to_string(),
            "Invalid Room ID: expected 64 characters, got 3"
        );

        let not_hex = "g".repeat(ROOM_ID_LENGTH);
        let err = parse_room_id(&not_hex).unwrap_err();
        assert_eq!(err, RoomIdError::NotHex);
        assert_eq!(err.to_string(), "Invalid Room ID: must be a valid hex string");
    }
}
