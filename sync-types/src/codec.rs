//! Message codec - the private byte format shared by both devices.
//!
//! Messages are MessagePack with named fields, so a peer running an older
//! build can still decode messages that gained optional fields.

use crate::{CodecError, SyncMessage, PROTOCOL_VERSION};

/// Encode a message into bytes for the transport.
pub fn encode(message: &SyncMessage) -> Result<Vec<u8>, CodecError> {
    rmp_serde::to_vec_named(message).map_err(CodecError::Encode)
}

/// Decode bytes received from the transport.
///
/// Fails with [`CodecError::Malformed`] when required fields are missing or
/// have the wrong shape, and with [`CodecError::UnsupportedVersion`] for a
/// protocol version this build does not speak.
pub fn decode(bytes: &[u8]) -> Result<SyncMessage, CodecError> {
    let message: SyncMessage =
        rmp_serde::from_slice(bytes).map_err(|e| CodecError::Malformed(e.to_string()))?;

    if message.version != PROTOCOL_VERSION {
        return Err(CodecError::UnsupportedVersion(message.version));
    }
    if message.sequence.value() == 0 {
        return Err(CodecError::Malformed("sequence number 0 is reserved".into()));
    }

    Ok(message)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        AckOutcome, AckPayload, DeviceId, DeviceRole, Payload, SequenceNumber,
        SetCompletionPayload, SharedWorkoutSessionSnapshot, TimerStatePayload,
    };
    use serde::Serialize;

    fn message(payload: Payload) -> SyncMessage {
        SyncMessage::new(
            DeviceId::random(),
            DeviceRole::Handheld,
            SequenceNumber::new(7),
            payload,
        )
    }

    #[test]
    fn set_completion_survives_codec() {
        let original = message(Payload::SetCompletion(SetCompletionPayload {
            set_id: "set-1".into(),
            session_exercise_id: "squat".into(),
            reps: 5,
            weight: 100.0,
            is_completed: true,
        }));

        let decoded = decode(&encode(&original).unwrap()).unwrap();
        assert_eq!(decoded, original);
    }

    #[test]
    fn unit_and_optional_fields_survive_codec() {
        let heartbeat = message(Payload::Heartbeat);
        assert_eq!(decode(&encode(&heartbeat).unwrap()).unwrap(), heartbeat);

        let timer = message(Payload::TimerState(TimerStatePayload {
            is_running: false,
            duration_secs: 0,
            start_time: None,
            exercise_name: None,
        }));
        assert_eq!(decode(&encode(&timer).unwrap()).unwrap(), timer);
    }

    #[test]
    fn ack_carries_acknowledged_id() {
        let acked = message(Payload::Heartbeat).id();
        let ack = message(Payload::Ack(AckPayload {
            acknowledged: acked,
            outcome: AckOutcome::Applied,
        }));

        match decode(&encode(&ack).unwrap()).unwrap().payload {
            Payload::Ack(payload) => assert_eq!(payload.acknowledged, acked),
            other => panic!("expected Ack, got {:?}", other),
        }
    }

    #[test]
    fn garbage_is_malformed() {
        let result = decode(&[0xFF, 0x00, 0x13, 0x37]);
        assert!(matches!(result, Err(CodecError::Malformed(_))));
    }

    #[test]
    fn empty_input_is_malformed() {
        assert!(matches!(decode(&[]), Err(CodecError::Malformed(_))));
    }

    #[test]
    fn missing_fields_are_malformed() {
        #[derive(Serialize)]
        struct Partial {
            version: u8,
            created_at: u64,
        }
        let bytes = rmp_serde::to_vec_named(&Partial {
            version: 1,
            created_at: 5,
        })
        .unwrap();

        assert!(matches!(decode(&bytes), Err(CodecError::Malformed(_))));
    }

    #[test]
    fn wrong_payload_shape_is_malformed() {
        let mut msg = message(Payload::WorkoutStart(SharedWorkoutSessionSnapshot {
            id: "w1".into(),
            title: "Push day".into(),
            start_time: 1,
            duration_secs: None,
            current_exercise_index: 0,
            total_exercises: 4,
        }));
        msg.created_at = 1;
        let mut bytes = encode(&msg).unwrap();
        // Chop the tail so the body map is incomplete.
        bytes.truncate(bytes.len() - 6);

        assert!(matches!(decode(&bytes), Err(CodecError::Malformed(_))));
    }

    #[test]
    fn unknown_version_is_rejected() {
        let mut msg = message(Payload::Heartbeat);
        msg.version = 9;
        let bytes = encode(&msg).unwrap();

        assert!(matches!(
            decode(&bytes),
            Err(CodecError::UnsupportedVersion(9))
        ));
    }

    #[test]
    fn sequence_zero_is_rejected() {
        let mut msg = message(Payload::Heartbeat);
        msg.sequence = SequenceNumber::zero();
        let bytes = encode(&msg).unwrap();

        assert!(matches!(decode(&bytes), Err(CodecError::Malformed(_))));
    }
}
